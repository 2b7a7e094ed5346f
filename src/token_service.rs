use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::token::TokenSigner;

const HTTP_MAX_REQUEST_BYTES: usize = 256 * 1024;
const HTTP_READ_CHUNK_BYTES: usize = 4096;

#[derive(Debug, Deserialize)]
struct TokenRequest {
    topic: String,
    #[serde(default)]
    id: Option<String>,
}

/// Issues signed, time-limited topic credentials over HTTP. Stateless by
/// construction: nothing is stored, so tokens cannot be revoked before
/// expiry.
#[derive(Clone)]
pub struct TokenService {
    signer: TokenSigner,
}

impl TokenService {
    pub fn new(signer: TokenSigner) -> Self {
        Self { signer }
    }

    pub async fn run(self, bind: String, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("failed binding token service on {bind}"))?;
        let bound = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!("token service listening on http://{bound}");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("token service shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let signer = self.signer.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_http_connection(stream, signer).await {
                                    warn!("token service connection {remote_addr} failed: {err:#}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("token service accept failed: {err}");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_http_connection(mut stream: TcpStream, signer: TokenSigner) -> Result<()> {
    let Some(request) = read_http_request(&mut stream).await? else {
        return Ok(());
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/token") => match mint_token_payload(&signer, &request.body) {
            Ok(payload) => write_http_json_response(&mut stream, 200, &payload).await,
            Err(err) => {
                let payload = json!({
                    "ok": false,
                    "error": {
                        "code": 400,
                        "message": err.to_string()
                    }
                });
                write_http_json_response(&mut stream, 400, &payload).await
            }
        },
        ("GET", "/health") => {
            write_http_json_response(&mut stream, 200, &json!({ "ok": true })).await
        }
        ("GET", _) | ("POST", _) => {
            let payload = json!({
                "ok": false,
                "error": "not_found",
                "path": request.path
            });
            write_http_json_response(&mut stream, 404, &payload).await
        }
        _ => {
            let payload = json!({
                "ok": false,
                "error": "method_not_allowed"
            });
            write_http_json_response(&mut stream, 405, &payload).await
        }
    }
}

fn mint_token_payload(signer: &TokenSigner, body: &[u8]) -> Result<Value> {
    let request: TokenRequest =
        serde_json::from_slice(body).context("invalid /token JSON payload")?;
    let topic = request.topic.trim().to_owned();
    if topic.is_empty() {
        anyhow::bail!("invalid /token payload: topic is required");
    }
    let id = request
        .id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("client-{}", Uuid::new_v4()));
    let token = signer.mint(&id, &topic)?;
    Ok(json!({
        "id": id,
        "topic": topic,
        "token": token
    }))
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn find_http_header_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    for idx in 0..buf.len().saturating_sub(3) {
        if &buf[idx..idx + 4] == b"\r\n\r\n" {
            return Some((idx, 4));
        }
    }
    for idx in 0..buf.len().saturating_sub(1) {
        if &buf[idx..idx + 2] == b"\n\n" {
            return Some((idx, 2));
        }
    }
    None
}

fn parse_http_content_length(headers: &str) -> Option<usize> {
    for line in headers.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                if let Ok(parsed) = value.trim().parse::<usize>() {
                    return Some(parsed);
                }
            }
        }
    }
    None
}

async fn read_http_request(stream: &mut TcpStream) -> Result<Option<HttpRequest>> {
    let mut buffer = Vec::with_capacity(8 * 1024);
    let mut chunk = vec![0_u8; HTTP_READ_CHUNK_BYTES];
    let mut header_info: Option<(usize, usize, usize)> = None;

    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .context("failed reading token request bytes")?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > HTTP_MAX_REQUEST_BYTES {
            anyhow::bail!("token request exceeds max size");
        }

        if header_info.is_none() {
            if let Some((header_end, separator_len)) = find_http_header_terminator(&buffer) {
                let headers = String::from_utf8_lossy(&buffer[..header_end]);
                let content_length = parse_http_content_length(&headers).unwrap_or(0);
                header_info = Some((header_end, separator_len, content_length));
            }
        }

        if let Some((header_end, separator_len, content_length)) = header_info {
            if buffer.len() >= header_end + separator_len + content_length {
                break;
            }
        }
    }

    if buffer.is_empty() {
        return Ok(None);
    }

    let (header_end, separator_len) = find_http_header_terminator(&buffer)
        .ok_or_else(|| anyhow::anyhow!("invalid token request: missing header terminator"))?;
    let headers = String::from_utf8_lossy(&buffer[..header_end]);
    let request_line = headers.lines().next().unwrap_or_default();
    let mut segments = request_line.split_whitespace();
    let method = segments
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_uppercase();
    let path_raw = segments.next().unwrap_or("/").trim();
    if method.is_empty() {
        anyhow::bail!("invalid token request line");
    }
    let path = path_raw
        .split('?')
        .next()
        .unwrap_or(path_raw)
        .trim()
        .to_owned();
    let content_length = parse_http_content_length(&headers).unwrap_or(0);
    let body_start = header_end + separator_len;
    if buffer.len() < body_start + content_length {
        anyhow::bail!("truncated token request body");
    }
    let body = if content_length == 0 {
        Vec::new()
    } else {
        buffer[body_start..body_start + content_length].to_vec()
    };
    Ok(Some(HttpRequest { method, path, body }))
}

async fn write_http_json_response(
    stream: &mut TcpStream,
    status_code: u16,
    payload: &Value,
) -> Result<()> {
    let status_text = match status_code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "OK",
    };
    let body = serde_json::to_vec(payload).context("failed serializing token response body")?;
    let head = format!(
        "HTTP/1.1 {status_code} {status_text}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\nCache-Control: no-store\r\n\r\n",
        body.len()
    );
    stream
        .write_all(head.as_bytes())
        .await
        .context("failed writing token response headers")?;
    stream
        .write_all(&body)
        .await
        .context("failed writing token response body")?;
    let _ = stream.shutdown().await;
    Ok(())
}
