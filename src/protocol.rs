use serde_json::{json, Value};

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_PRESENCE_STATE: &str = "presence_state";
pub const EVENT_PRESENCE_DIFF: &str = "presence_diff";
pub const EVENT_HEARTBEAT: &str = "heartbeat";

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";

const FRAME_ARITY: usize = 5;

/// One wire message: `[join_ref, ref, topic, event, payload]`.
///
/// `join_ref` identifies a topic-join lifetime and is echoed on every
/// server message for that topic; `reference` correlates one request with
/// its reply. Both are `null` on server-initiated pushes.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub join_ref: Option<String>,
    pub reference: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Frame {
    pub fn to_text(&self) -> String {
        json!([
            self.join_ref,
            self.reference,
            self.topic,
            self.event,
            self.payload
        ])
        .to_string()
    }
}

/// Frame rejection reasons. Every variant is fatal for the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Oversized { len: usize, max: usize },
    Json(String),
    Arity(usize),
    FieldType(&'static str),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Oversized { len, max } => {
                write!(f, "frame of {len} bytes exceeds limit of {max} bytes")
            }
            FrameError::Json(err) => write!(f, "invalid JSON frame: {err}"),
            FrameError::Arity(len) => {
                write!(f, "frame must have {FRAME_ARITY} elements, got {len}")
            }
            FrameError::FieldType(field) => write!(f, "frame field {field} has the wrong type"),
        }
    }
}

impl std::error::Error for FrameError {}

pub fn parse_frame_text(text: &str, max_bytes: usize) -> Result<Frame, FrameError> {
    if text.len() > max_bytes {
        return Err(FrameError::Oversized {
            len: text.len(),
            max: max_bytes,
        });
    }
    let value: Value =
        serde_json::from_str(text).map_err(|err| FrameError::Json(err.to_string()))?;
    let Value::Array(items) = value else {
        return Err(FrameError::FieldType("frame"));
    };
    if items.len() != FRAME_ARITY {
        return Err(FrameError::Arity(items.len()));
    }
    let mut items = items.into_iter();
    let join_ref = optional_string(items.next().unwrap_or(Value::Null), "join_ref")?;
    let reference = optional_string(items.next().unwrap_or(Value::Null), "ref")?;
    let topic = required_string(items.next().unwrap_or(Value::Null), "topic")?;
    let event = required_string(items.next().unwrap_or(Value::Null), "event")?;
    let payload = items.next().unwrap_or(Value::Null);
    Ok(Frame {
        join_ref,
        reference,
        topic,
        event,
        payload,
    })
}

fn optional_string(value: Value, field: &'static str) -> Result<Option<String>, FrameError> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(text)),
        _ => Err(FrameError::FieldType(field)),
    }
}

fn required_string(value: Value, field: &'static str) -> Result<String, FrameError> {
    match value {
        Value::String(text) if !text.is_empty() => Ok(text),
        _ => Err(FrameError::FieldType(field)),
    }
}

pub fn reply_ok_frame(
    join_ref: Option<String>,
    reference: Option<String>,
    topic: &str,
    response: Value,
) -> Frame {
    reply_frame(join_ref, reference, topic, STATUS_OK, response)
}

pub fn reply_error_frame(
    join_ref: Option<String>,
    reference: Option<String>,
    topic: &str,
    reason: &str,
) -> Frame {
    reply_frame(
        join_ref,
        reference,
        topic,
        STATUS_ERROR,
        json!({ "reason": reason }),
    )
}

fn reply_frame(
    join_ref: Option<String>,
    reference: Option<String>,
    topic: &str,
    status: &str,
    response: Value,
) -> Frame {
    Frame {
        join_ref,
        reference,
        topic: topic.to_owned(),
        event: EVENT_REPLY.to_owned(),
        payload: json!({
            "status": status,
            "response": response,
        }),
    }
}

/// Server-initiated push: no join_ref/ref because it answers no client
/// request.
pub fn push_frame(topic: &str, event: &str, payload: Value) -> Frame {
    Frame {
        join_ref: None,
        reference: None,
        topic: topic.to_owned(),
        event: event.to_owned(),
        payload,
    }
}
