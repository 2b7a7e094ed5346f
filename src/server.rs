use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::hub::{now_ms, ConnectionEntry, Hub};
use crate::protocol::{self, Frame};

/// WebSocket transport: accepts upgrades and runs one reader loop plus
/// one writer task per connection, so a slow reader never blocks outbound
/// delivery and vice versa.
pub struct WsServer {
    cfg: ServerConfig,
    hub: Arc<Hub>,
}

impl WsServer {
    pub fn new(cfg: ServerConfig, hub: Arc<Hub>) -> Self {
        Self { cfg, hub }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let listener = TcpListener::bind(&self.cfg.bind)
            .await
            .with_context(|| format!("failed binding hub listener on {}", self.cfg.bind))?;
        let bound_addr = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!("hub listening on ws://{bound_addr}");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("hub listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let hub = self.hub.clone();
                            let cfg = self.cfg.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, remote_addr, hub, cfg).await {
                                    warn!("hub connection failed: {err:#}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("hub accept failed: {err}");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    remote_addr: std::net::SocketAddr,
    hub: Arc<Hub>,
    cfg: ServerConfig,
) -> Result<()> {
    let ws = accept_async(stream)
        .await
        .with_context(|| format!("websocket upgrade failed for {remote_addr}"))?;
    let (mut write, mut read) = ws.split();
    let (entry, mut out_rx) = hub.register(remote_addr).await;
    info!("client connected conn_id={} remote={}", entry.id, remote_addr);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    let mut liveness_check =
        tokio::time::interval(Duration::from_millis(cfg.heartbeat_interval_ms.max(100)));
    liveness_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let close_reason = loop {
        tokio::select! {
            _ = entry.closed() => {
                break Some(close_frame(1008, "outbound queue overflow"));
            }
            _ = liveness_check.tick() => {
                let silent_for = now_ms().saturating_sub(entry.last_heartbeat_ms());
                if silent_for > cfg.heartbeat_timeout_ms {
                    info!(
                        "closing conn {} after {}ms without heartbeat",
                        entry.id, silent_for
                    );
                    break Some(close_frame(1008, "heartbeat timeout"));
                }
            }
            inbound = read.next() => {
                let Some(inbound) = inbound else {
                    break None;
                };
                let inbound = match inbound {
                    Ok(message) => message,
                    Err(err) => {
                        debug!("websocket inbound error on conn {}: {err}", entry.id);
                        break None;
                    }
                };
                match inbound {
                    Message::Text(text) => {
                        match protocol::parse_frame_text(&text, cfg.max_frame_bytes) {
                            Ok(frame) => dispatch_frame(&hub, &entry, frame).await,
                            Err(err) => {
                                warn!("protocol error on conn {}: {err}", entry.id);
                                break Some(close_frame(1002, "protocol error"));
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        let _ = entry.enqueue_message(Message::Pong(payload));
                    }
                    Message::Close(_) => break None,
                    Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
        }
    };

    hub.disconnect(&entry).await;
    if let Some(frame) = close_reason {
        let _ = entry.enqueue_message(Message::Close(Some(frame)));
    }
    info!("client disconnected conn_id={}", entry.id);
    drop(entry);
    let _ = writer.await;
    Ok(())
}

async fn dispatch_frame(hub: &Arc<Hub>, entry: &Arc<ConnectionEntry>, frame: Frame) {
    match frame.event.as_str() {
        protocol::EVENT_JOIN => hub.join(entry, frame).await,
        protocol::EVENT_LEAVE => hub.leave(entry, frame).await,
        protocol::EVENT_HEARTBEAT if frame.topic == hub.system_topic() => {
            hub.heartbeat(entry, &frame);
        }
        protocol::EVENT_REPLY | protocol::EVENT_PRESENCE_STATE | protocol::EVENT_PRESENCE_DIFF => {
            debug!(
                "ignoring reserved event {} from conn {}",
                frame.event, entry.id
            );
        }
        _ => hub.push(entry, frame).await,
    }
}

fn close_frame(code: u16, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::sync::{broadcast, mpsc};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Message;

    use crate::bus::BusCommand;
    use crate::config::Config;
    use crate::hub::Hub;
    use crate::token::TokenSigner;

    use super::WsServer;

    type WsClient = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    struct TestServer {
        url: String,
        hub: Arc<Hub>,
        signer: TokenSigner,
        bus_rx: mpsc::UnboundedReceiver<BusCommand>,
        shutdown_tx: broadcast::Sender<()>,
    }

    fn reserve_bind() -> Result<String> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);
        Ok(addr.to_string())
    }

    async fn start_server(mutate: impl FnOnce(&mut Config)) -> Result<TestServer> {
        let bind = reserve_bind()?;
        let mut cfg = Config::default();
        cfg.server.bind = bind.clone();
        cfg.server.http_bind = None;
        cfg.auth.secret = "ws-test-secret".to_owned();
        cfg.auth.token_ttl_secs = 60;
        mutate(&mut cfg);

        let signer = TokenSigner::new(cfg.auth.secret.clone(), cfg.auth.token_ttl_secs);
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let hub = Hub::new(&cfg, signer.clone(), bus_tx);
        let (shutdown_tx, _) = broadcast::channel(1);
        let server = WsServer::new(cfg.server.clone(), hub.clone());
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { server.run(shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        Ok(TestServer {
            url: format!("ws://{bind}"),
            hub,
            signer,
            bus_rx,
            shutdown_tx,
        })
    }

    async fn ws_connect(url: &str) -> Result<WsClient> {
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..5 {
            match connect_async(url).await {
                Ok((ws, _)) => return Ok(ws),
                Err(err) => {
                    last_err = Some(err.into());
                    if attempt < 4 {
                        tokio::time::sleep(Duration::from_millis(30 * (attempt + 1) as u64)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("websocket connect failed")))
    }

    async fn send_frame(ws: &mut WsClient, frame: Value) -> Result<()> {
        ws.send(Message::Text(frame.to_string())).await?;
        Ok(())
    }

    async fn recv_frame(ws: &mut WsClient) -> Result<Value> {
        let deadline = Duration::from_secs(2);
        tokio::time::timeout(deadline, async {
            loop {
                let message = ws
                    .next()
                    .await
                    .ok_or_else(|| anyhow::anyhow!("connection closed while expecting frame"))??;
                if let Message::Text(text) = message {
                    return Ok::<Value, anyhow::Error>(serde_json::from_str(&text)?);
                }
            }
        })
        .await?
    }

    async fn expect_silence(ws: &mut WsClient) {
        let outcome = tokio::time::timeout(Duration::from_millis(150), ws.next()).await;
        assert!(outcome.is_err(), "expected no frame, got {outcome:?}");
    }

    async fn join(ws: &mut WsClient, join_ref: &str, reference: &str, topic: &str, token: &str) -> Result<Value> {
        send_frame(
            ws,
            json!([join_ref, reference, topic, "phx_join", { "token": token }]),
        )
        .await?;
        recv_frame(ws).await
    }

    #[tokio::test]
    async fn issued_token_joins_system_topic_and_sees_itself() -> Result<()> {
        let mut server = start_server(|_| {}).await?;
        let token = server.signer.mint("c1", "system")?;
        let mut ws = ws_connect(&server.url).await?;

        let reply = join(&mut ws, "1", "1", "system", &token).await?;
        assert_eq!(reply[0], json!("1"));
        assert_eq!(reply[1], json!("1"));
        assert_eq!(reply[2], json!("system"));
        assert_eq!(reply[3], json!("phx_reply"));
        assert_eq!(reply.pointer("/4/status").and_then(Value::as_str), Some("ok"));

        let state = recv_frame(&mut ws).await?;
        assert_eq!(state[3], json!("presence_state"));
        let roster = state[4].as_object().expect("roster object");
        assert_eq!(roster.len(), 1);
        assert!(roster.contains_key("c1"));

        assert_eq!(
            server.bus_rx.recv().await,
            Some(BusCommand::Subscribe("system".to_owned()))
        );
        let _ = server.shutdown_tx.send(());
        Ok(())
    }

    #[tokio::test]
    async fn topic_claim_mismatch_rejects_join_and_leaves_membership_alone() -> Result<()> {
        let mut server = start_server(|_| {}).await?;
        let token = server.signer.mint("c1", "rooms:a")?;
        let mut ws = ws_connect(&server.url).await?;

        let reply = join(&mut ws, "1", "1", "rooms:b", &token).await?;
        assert_eq!(reply.pointer("/4/status").and_then(Value::as_str), Some("error"));
        assert_eq!(
            reply.pointer("/4/response/reason").and_then(Value::as_str),
            Some("credential topic mismatch")
        );
        assert_eq!(server.hub.member_count("rooms:b").await, 0);
        assert!(server.bus_rx.try_recv().is_err());

        // the connection survives a failed join
        send_frame(&mut ws, json!([null, "hb", "phoenix", "heartbeat", {}])).await?;
        let heartbeat_reply = recv_frame(&mut ws).await?;
        assert_eq!(heartbeat_reply.pointer("/4/status").and_then(Value::as_str), Some("ok"));

        let _ = server.shutdown_tx.send(());
        Ok(())
    }

    #[tokio::test]
    async fn expired_token_is_rejected() -> Result<()> {
        let server = start_server(|_| {}).await?;
        let issued_at = crate::token::now_secs() - 120;
        let token = server.signer.sign_claims(&crate::token::Claims {
            id: "c1".to_owned(),
            topic: "rooms:a".to_owned(),
            issued_at,
            expires_at: issued_at + 30,
        })?;
        let mut ws = ws_connect(&server.url).await?;

        let reply = join(&mut ws, "1", "1", "rooms:a", &token).await?;
        assert_eq!(
            reply.pointer("/4/response/reason").and_then(Value::as_str),
            Some("expired credential")
        );
        let _ = server.shutdown_tx.send(());
        Ok(())
    }

    #[tokio::test]
    async fn pushes_only_flow_to_the_bus_while_joined() -> Result<()> {
        let mut server = start_server(|_| {}).await?;
        let token = server.signer.mint("c1", "acars:uplink")?;
        let mut ws = ws_connect(&server.url).await?;

        send_frame(
            &mut ws,
            json!([null, "2", "acars:uplink", "set_rate", { "hz": 2 }]),
        )
        .await?;
        let reply = recv_frame(&mut ws).await?;
        assert_eq!(
            reply.pointer("/4/response/reason").and_then(Value::as_str),
            Some("not joined")
        );
        assert_eq!(reply[1], json!("2"));
        assert!(server.bus_rx.try_recv().is_err());

        let _ = join(&mut ws, "1", "3", "acars:uplink", &token).await?;
        let _ = recv_frame(&mut ws).await?; // presence_state
        assert_eq!(
            server.bus_rx.recv().await,
            Some(BusCommand::Subscribe("acars:uplink".to_owned()))
        );

        send_frame(
            &mut ws,
            json!(["1", "4", "acars:uplink", "set_rate", { "hz": 2 }]),
        )
        .await?;
        assert_eq!(
            server.bus_rx.recv().await,
            Some(BusCommand::Publish {
                topic: "acars:uplink".to_owned(),
                event: "set_rate".to_owned(),
                payload: json!({ "hz": 2 }),
            })
        );
        assert!(server.bus_rx.try_recv().is_err(), "exactly one publish expected");

        let _ = server.shutdown_tx.send(());
        Ok(())
    }

    #[tokio::test]
    async fn bus_traffic_reaches_joined_clients_as_null_ref_pushes() -> Result<()> {
        let server = start_server(|_| {}).await?;
        let token = server.signer.mint("c1", "aircraft:state")?;
        let mut member = ws_connect(&server.url).await?;
        let mut outsider = ws_connect(&server.url).await?;

        let _ = join(&mut member, "1", "1", "aircraft:state", &token).await?;
        let _ = recv_frame(&mut member).await?; // presence_state

        server
            .hub
            .deliver_from_bus("aircraft:state", "position", json!({ "alt": 37000 }))
            .await;

        let push = recv_frame(&mut member).await?;
        assert_eq!(
            push,
            json!([null, null, "aircraft:state", "position", { "alt": 37000 }])
        );
        expect_silence(&mut outsider).await;

        let _ = server.shutdown_tx.send(());
        Ok(())
    }

    #[tokio::test]
    async fn presence_flows_between_two_clients() -> Result<()> {
        let server = start_server(|_| {}).await?;
        let token_a = server.signer.mint("alice", "rooms:lobby")?;
        let token_b = server.signer.mint("bob", "rooms:lobby")?;
        let mut alice = ws_connect(&server.url).await?;
        let mut bob = ws_connect(&server.url).await?;

        let _ = join(&mut alice, "1", "1", "rooms:lobby", &token_a).await?;
        let state = recv_frame(&mut alice).await?;
        let roster = state[4].as_object().expect("roster");
        assert_eq!(roster.len(), 1);
        assert!(roster.contains_key("alice"));

        let _ = join(&mut bob, "7", "1", "rooms:lobby", &token_b).await?;
        let state = recv_frame(&mut bob).await?;
        let roster = state[4].as_object().expect("roster");
        assert_eq!(roster.len(), 2);
        assert!(roster.contains_key("alice") && roster.contains_key("bob"));

        let diff = recv_frame(&mut alice).await?;
        assert_eq!(diff[3], json!("presence_diff"));
        // the diff echoes alice's own join_ref for the topic
        assert_eq!(diff[0], json!("1"));
        assert!(diff.pointer("/4/joins/bob").is_some());
        assert_eq!(diff.pointer("/4/leaves").and_then(Value::as_object).map(|m| m.len()), Some(0));

        let _ = server.shutdown_tx.send(());
        Ok(())
    }

    #[tokio::test]
    async fn abrupt_disconnect_broadcasts_leaves_and_releases_empty_topics() -> Result<()> {
        let mut server = start_server(|_| {}).await?;
        let token_a = server.signer.mint("alice", "rooms:one")?;
        let token_b1 = server.signer.mint("bob", "rooms:one")?;
        let token_b2 = server.signer.mint("bob", "rooms:two")?;
        let mut alice = ws_connect(&server.url).await?;
        let mut bob = ws_connect(&server.url).await?;

        let _ = join(&mut alice, "1", "1", "rooms:one", &token_a).await?;
        let _ = recv_frame(&mut alice).await?;
        let _ = join(&mut bob, "1", "1", "rooms:one", &token_b1).await?;
        let _ = recv_frame(&mut bob).await?;
        let _ = join(&mut bob, "2", "2", "rooms:two", &token_b2).await?;
        let _ = recv_frame(&mut bob).await?;
        let _ = recv_frame(&mut alice).await?; // bob's join diff

        drop(bob);

        let diff = recv_frame(&mut alice).await?;
        assert_eq!(diff[3], json!("presence_diff"));
        assert!(diff.pointer("/4/leaves/bob").is_some());
        expect_silence(&mut alice).await;

        let mut commands = Vec::new();
        while let Ok(command) =
            tokio::time::timeout(Duration::from_millis(200), server.bus_rx.recv()).await
        {
            if let Some(command) = command {
                commands.push(command);
            } else {
                break;
            }
        }
        assert!(commands.contains(&BusCommand::Unsubscribe("rooms:two".to_owned())));
        assert!(!commands.contains(&BusCommand::Unsubscribe("rooms:one".to_owned())));

        let _ = server.shutdown_tx.send(());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_frames_close_the_connection_with_protocol_error() -> Result<()> {
        let server = start_server(|_| {}).await?;
        let mut ws = ws_connect(&server.url).await?;

        ws.send(Message::Text("not json".to_owned())).await?;

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(frame))) => return frame,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await?;
        if let Some(frame) = closed {
            assert_eq!(frame.code, CloseCode::Protocol);
        }

        let _ = server.shutdown_tx.send(());
        Ok(())
    }

    #[tokio::test]
    async fn wrong_arity_is_fatal_but_failed_auth_is_not() -> Result<()> {
        let server = start_server(|_| {}).await?;
        let mut ws = ws_connect(&server.url).await?;

        // failed join: connection stays usable
        send_frame(&mut ws, json!(["1", "1", "rooms:a", "phx_join", {}])).await?;
        let reply = recv_frame(&mut ws).await?;
        assert_eq!(
            reply.pointer("/4/response/reason").and_then(Value::as_str),
            Some("missing credential")
        );

        // wrong arity: fatal
        send_frame(&mut ws, json!(["1", "1", "rooms:a", "phx_join"])).await?;
        let terminated = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return true,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await?;
        assert!(terminated);

        let _ = server.shutdown_tx.send(());
        Ok(())
    }

    #[tokio::test]
    async fn missing_heartbeats_time_the_connection_out() -> Result<()> {
        let server = start_server(|cfg| {
            cfg.server.heartbeat_interval_ms = 100;
            cfg.server.heartbeat_timeout_ms = 300;
        })
        .await?;
        let mut ws = ws_connect(&server.url).await?;

        let closed = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(frame))) => return frame,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await?;
        if let Some(frame) = closed {
            assert_eq!(frame.code, CloseCode::Policy);
        }
        assert_eq!(server.hub.connection_count().await, 0);

        let _ = server.shutdown_tx.send(());
        Ok(())
    }

    #[tokio::test]
    async fn heartbeats_keep_the_connection_alive() -> Result<()> {
        let server = start_server(|cfg| {
            cfg.server.heartbeat_interval_ms = 100;
            cfg.server.heartbeat_timeout_ms = 400;
        })
        .await?;
        let mut ws = ws_connect(&server.url).await?;

        for n in 0..5 {
            send_frame(
                &mut ws,
                json!([null, format!("hb-{n}"), "phoenix", "heartbeat", {}]),
            )
            .await?;
            let reply = recv_frame(&mut ws).await?;
            assert_eq!(reply[1], json!(format!("hb-{n}")));
            assert_eq!(reply.pointer("/4/status").and_then(Value::as_str), Some("ok"));
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        assert_eq!(server.hub.connection_count().await, 1);

        let _ = server.shutdown_tx.send(());
        Ok(())
    }

    #[tokio::test]
    async fn join_ref_stays_constant_until_leave() -> Result<()> {
        let server = start_server(|_| {}).await?;
        let token = server.signer.mint("c1", "rooms:lobby")?;
        let token2 = server.signer.mint("c2", "rooms:lobby")?;
        let mut ws = ws_connect(&server.url).await?;
        let mut other = ws_connect(&server.url).await?;

        let reply = join(&mut ws, "42", "1", "rooms:lobby", &token).await?;
        assert_eq!(reply[0], json!("42"));
        let state = recv_frame(&mut ws).await?;
        assert_eq!(state[0], json!("42"));

        // a second member joining produces a diff that still carries 42
        let _ = join(&mut other, "9", "1", "rooms:lobby", &token2).await?;
        let _ = recv_frame(&mut other).await?;
        let diff = recv_frame(&mut ws).await?;
        assert_eq!(diff[0], json!("42"));

        send_frame(&mut ws, json!(["42", "2", "rooms:lobby", "phx_leave", {}])).await?;
        let reply = recv_frame(&mut ws).await?;
        assert_eq!(reply[0], json!("42"));
        assert_eq!(reply.pointer("/4/status").and_then(Value::as_str), Some("ok"));

        let _ = server.shutdown_tx.send(());
        Ok(())
    }
}
