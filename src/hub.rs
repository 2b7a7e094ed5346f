use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::bus::BusCommand;
use crate::config::Config;
use crate::presence::{self, Roster};
use crate::protocol::{self, Frame};
use crate::token::TokenSigner;

pub type ConnId = u64;

/// Per-connection state owned by the registry. Topic members hold an
/// `Arc` reference back to their connection, never the other way around.
pub struct ConnectionEntry {
    pub id: ConnId,
    pub remote: SocketAddr,
    tx: mpsc::Sender<Message>,
    closer: Notify,
    last_heartbeat_ms: AtomicU64,
    /// topic -> join_ref for every joined topic of this connection.
    joined: Mutex<HashMap<String, String>>,
}

impl ConnectionEntry {
    /// Refreshes the liveness deadline.
    pub fn touch(&self) {
        self.last_heartbeat_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_heartbeat_ms(&self) -> u64 {
        self.last_heartbeat_ms.load(Ordering::Relaxed)
    }

    /// Resolves once the hub decided this connection must go away, e.g.
    /// after an outbound queue overflow.
    pub async fn closed(&self) {
        self.closer.notified().await;
    }

    fn enqueue(&self, frame: &Frame) -> bool {
        self.enqueue_message(Message::Text(frame.to_text()))
    }

    /// Non-blocking enqueue onto the bounded outbound queue. A full queue
    /// marks the connection for closing instead of blocking or silently
    /// dropping: one slow client never absorbs unbounded memory.
    pub fn enqueue_message(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "outbound queue overflow on conn {}, closing connection",
                    self.id
                );
                self.closer.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

struct Member {
    join_ref: String,
    client_id: String,
    conn: Arc<ConnectionEntry>,
}

struct TopicState {
    members: HashMap<ConnId, Member>,
    roster: Roster,
    /// Set when the last member left and the topic was dropped from the
    /// map; joiners that raced for this state re-resolve a fresh one.
    retired: bool,
}

impl TopicState {
    fn new() -> Self {
        Self {
            members: HashMap::new(),
            roster: Roster::new(),
            retired: false,
        }
    }
}

/// Connection registry plus topic router. Global maps are locked only for
/// entry lookup/insert/remove; all membership work happens under the
/// owning topic's lock, so unrelated topics never contend.
pub struct Hub {
    conns: Mutex<HashMap<ConnId, Arc<ConnectionEntry>>>,
    topics: Mutex<HashMap<String, Arc<Mutex<TopicState>>>>,
    bus_tx: mpsc::UnboundedSender<BusCommand>,
    signer: TokenSigner,
    system_topic: String,
    public_topics: Vec<String>,
    queue_capacity: usize,
    next_conn_id: AtomicU64,
}

impl Hub {
    pub fn new(cfg: &Config, signer: TokenSigner, bus_tx: mpsc::UnboundedSender<BusCommand>) -> Arc<Self> {
        Arc::new(Self {
            conns: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            bus_tx,
            signer,
            system_topic: cfg.auth.system_topic.clone(),
            public_topics: cfg.auth.public_topics.clone(),
            queue_capacity: cfg.server.outbound_queue_capacity.max(8),
            next_conn_id: AtomicU64::new(0),
        })
    }

    pub fn system_topic(&self) -> &str {
        &self.system_topic
    }

    pub async fn register(&self, remote: SocketAddr) -> (Arc<ConnectionEntry>, mpsc::Receiver<Message>) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let entry = Arc::new(ConnectionEntry {
            id,
            remote,
            tx,
            closer: Notify::new(),
            last_heartbeat_ms: AtomicU64::new(now_ms()),
            joined: Mutex::new(HashMap::new()),
        });
        self.conns.lock().await.insert(id, entry.clone());
        (entry, rx)
    }

    /// Tears a connection down: removes it from the registry and performs
    /// a forced leave for every topic it had joined, driving presence
    /// diffs and bus unsubscription exactly like an explicit `phx_leave`.
    pub async fn disconnect(&self, entry: &Arc<ConnectionEntry>) {
        self.conns.lock().await.remove(&entry.id);
        let mut topics: Vec<String> = {
            let mut joined = entry.joined.lock().await;
            joined.drain().map(|(topic, _)| topic).collect()
        };
        topics.sort();
        for topic in topics {
            self.remove_member(&topic, entry.id).await;
        }
    }

    /// `phx_join`: validate the credential, transition membership, reply,
    /// then emit presence state/diffs in membership order.
    pub async fn join(&self, entry: &Arc<ConnectionEntry>, frame: Frame) {
        let Frame {
            join_ref,
            reference,
            topic,
            payload,
            ..
        } = frame;
        let Some(join_ref) = join_ref else {
            self.reply_error(entry, None, reference, &topic, "missing join_ref");
            return;
        };
        let client_id = match self.authorize_join(entry, &topic, &payload) {
            Ok(client_id) => client_id,
            Err(reason) => {
                self.reply_error(entry, Some(join_ref), reference, &topic, reason);
                return;
            }
        };
        let meta = json!({ "online_at": now_ms() });

        loop {
            let handle = self.get_or_create_topic(&topic).await;
            let mut state = handle.lock().await;
            if state.retired {
                drop(state);
                tokio::task::yield_now().await;
                continue;
            }

            if state.members.is_empty() {
                let _ = self.bus_tx.send(BusCommand::Subscribe(topic.clone()));
            }
            let mut first_join = false;
            match state.members.remove(&entry.id) {
                // re-join replaces the join_ref, membership stays single
                Some(prev) if prev.client_id == client_id => {}
                Some(prev) => {
                    if let Some(prev_meta) = state.roster.leave(&prev.client_id) {
                        let diff = presence::leave_diff(&prev.client_id, &prev_meta);
                        broadcast_presence(&state, &topic, &diff, None);
                    }
                    first_join = state.roster.join(&client_id, meta.clone());
                }
                None => {
                    first_join = state.roster.join(&client_id, meta.clone());
                }
            }
            state.members.insert(
                entry.id,
                Member {
                    join_ref: join_ref.clone(),
                    client_id: client_id.clone(),
                    conn: entry.clone(),
                },
            );

            entry.enqueue(&protocol::reply_ok_frame(
                Some(join_ref.clone()),
                reference.clone(),
                &topic,
                json!({}),
            ));
            entry.enqueue(&Frame {
                join_ref: Some(join_ref.clone()),
                reference: None,
                topic: topic.clone(),
                event: protocol::EVENT_PRESENCE_STATE.to_owned(),
                payload: state.roster.state_payload(),
            });
            if first_join {
                let diff = presence::join_diff(&client_id, &meta);
                broadcast_presence(&state, &topic, &diff, Some(entry.id));
            }
            break;
        }

        entry
            .joined
            .lock()
            .await
            .insert(topic.clone(), join_ref.clone());
        debug!(
            "conn {} joined topic {} as {} (join_ref {})",
            entry.id, topic, client_id, join_ref
        );
    }

    /// `phx_leave`: reply ok, then the same teardown as a forced leave.
    pub async fn leave(&self, entry: &Arc<ConnectionEntry>, frame: Frame) {
        let Frame {
            join_ref,
            reference,
            topic,
            ..
        } = frame;
        let was_joined = entry.joined.lock().await.remove(&topic).is_some();
        if !was_joined {
            self.reply_error(entry, join_ref, reference, &topic, "not joined");
            return;
        }
        entry.enqueue(&protocol::reply_ok_frame(
            join_ref,
            reference,
            &topic,
            json!({}),
        ));
        self.remove_member(&topic, entry.id).await;
        debug!("conn {} left topic {}", entry.id, topic);
    }

    /// Ordinary event from a client. Joined: forwarded verbatim to the
    /// bus, fire-and-forget. Not joined: rejected, never forwarded.
    pub async fn push(&self, entry: &Arc<ConnectionEntry>, frame: Frame) {
        let joined = entry.joined.lock().await.contains_key(&frame.topic);
        if !joined {
            self.reply_error(
                entry,
                frame.join_ref,
                frame.reference,
                &frame.topic,
                "not joined",
            );
            return;
        }
        let _ = self.bus_tx.send(BusCommand::Publish {
            topic: frame.topic,
            event: frame.event,
            payload: frame.payload,
        });
    }

    /// Connection-level heartbeat on the system topic.
    pub fn heartbeat(&self, entry: &Arc<ConnectionEntry>, frame: &Frame) {
        entry.touch();
        entry.enqueue(&protocol::reply_ok_frame(
            frame.join_ref.clone(),
            frame.reference.clone(),
            &frame.topic,
            json!({}),
        ));
    }

    /// Delivery path for bus-inbound traffic: fan a server push out to
    /// every connection currently joined to `topic`.
    pub async fn deliver_from_bus(&self, topic: &str, event: &str, payload: Value) {
        let Some(handle) = self.lookup_topic(topic).await else {
            debug!("dropping bus message for inactive topic {topic}");
            return;
        };
        let state = handle.lock().await;
        let text = protocol::push_frame(topic, event, payload).to_text();
        for member in state.members.values() {
            member.conn.enqueue_message(Message::Text(text.clone()));
        }
    }

    fn authorize_join(
        &self,
        entry: &ConnectionEntry,
        topic: &str,
        payload: &Value,
    ) -> Result<String, &'static str> {
        if self.is_public_topic(topic) {
            let client_id = payload
                .get("id")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
                .unwrap_or_else(|| format!("conn-{}", entry.id));
            return Ok(client_id);
        }
        let token = payload
            .get("token")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or("missing credential")?;
        let claims = self.signer.verify(token).map_err(|err| err.reason())?;
        if claims.topic != topic {
            return Err("credential topic mismatch");
        }
        Ok(claims.id)
    }

    fn is_public_topic(&self, topic: &str) -> bool {
        topic == self.system_topic || self.public_topics.iter().any(|t| t == topic)
    }

    async fn remove_member(&self, topic: &str, conn_id: ConnId) {
        let Some(handle) = self.lookup_topic(topic).await else {
            return;
        };
        let mut state = handle.lock().await;
        let Some(member) = state.members.remove(&conn_id) else {
            return;
        };
        if let Some(meta) = state.roster.leave(&member.client_id) {
            let diff = presence::leave_diff(&member.client_id, &meta);
            broadcast_presence(&state, topic, &diff, None);
        }
        if state.members.is_empty() {
            state.retired = true;
            let _ = self.bus_tx.send(BusCommand::Unsubscribe(topic.to_owned()));
            drop(state);
            self.topics.lock().await.remove(topic);
            debug!("topic {topic} emptied, bus subscription released");
        }
    }

    async fn lookup_topic(&self, name: &str) -> Option<Arc<Mutex<TopicState>>> {
        self.topics.lock().await.get(name).cloned()
    }

    async fn get_or_create_topic(&self, name: &str) -> Arc<Mutex<TopicState>> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(TopicState::new())))
            .clone()
    }

    fn reply_error(
        &self,
        entry: &ConnectionEntry,
        join_ref: Option<String>,
        reference: Option<String>,
        topic: &str,
        reason: &str,
    ) {
        debug!("conn {} rejected on topic {topic}: {reason}", entry.id);
        entry.enqueue(&protocol::reply_error_frame(
            join_ref, reference, topic, reason,
        ));
    }

    #[cfg(test)]
    pub(crate) async fn member_count(&self, topic: &str) -> usize {
        match self.lookup_topic(topic).await {
            Some(handle) => handle.lock().await.members.len(),
            None => 0,
        }
    }

    #[cfg(test)]
    pub(crate) async fn connection_count(&self) -> usize {
        self.conns.lock().await.len()
    }
}

/// Fans a presence frame out to topic members, echoing each member's own
/// join_ref. Runs under the topic lock with non-blocking enqueues so the
/// diff order always matches the membership change order.
fn broadcast_presence(state: &TopicState, topic: &str, diff: &Value, exclude: Option<ConnId>) {
    for (conn_id, member) in &state.members {
        if exclude == Some(*conn_id) {
            continue;
        }
        member.conn.enqueue(&Frame {
            join_ref: Some(member.join_ref.clone()),
            reference: None,
            topic: topic.to_owned(),
            event: protocol::EVENT_PRESENCE_DIFF.to_owned(),
            payload: diff.clone(),
        });
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
