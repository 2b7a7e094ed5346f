use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::hub::Hub;

/// Commands from the topic router. Subscribe/Unsubscribe track the 0<->1
/// member transitions of a topic; Publish carries a client push.
#[derive(Debug, Clone, PartialEq)]
pub enum BusCommand {
    Subscribe(String),
    Unsubscribe(String),
    Publish {
        topic: String,
        event: String,
        payload: Value,
    },
}

pub fn inbound_pattern(topic: &str) -> String {
    format!("to:{topic}:*")
}

pub fn outbound_channel(topic: &str, event: &str) -> String {
    format!("from:{topic}:{event}")
}

/// Recovers the topic from the pattern that matched a delivery. Using the
/// pattern instead of the channel keeps topics containing `:` unambiguous.
pub fn topic_of_pattern(pattern: &str) -> Option<&str> {
    pattern.strip_prefix("to:")?.strip_suffix(":*")
}

/// The event is whatever follows `to:<topic>:` on the delivering channel.
pub fn event_of_channel<'a>(channel: &'a str, topic: &str) -> Option<&'a str> {
    channel
        .strip_prefix("to:")?
        .strip_prefix(topic)?
        .strip_prefix(':')
}

pub fn backoff_delay(cfg: &BusConfig, attempt: u32) -> Duration {
    let base = cfg.reconnect_base_delay_ms.max(1);
    let shift = attempt.min(16);
    let delay_ms = base
        .saturating_mul(1_u64 << shift)
        .min(cfg.reconnect_max_delay_ms.max(base));
    Duration::from_millis(delay_ms)
}

/// Bridge task. Keeps one pub/sub connection for `to:<topic>:*` patterns
/// and a `ConnectionManager` for outbound publishes. Bus loss never
/// touches client connections: the active pattern set is replayed on
/// reconnect, and client pushes are dropped while disconnected.
pub async fn run(
    cfg: BusConfig,
    hub: Arc<Hub>,
    mut commands: mpsc::UnboundedReceiver<BusCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut active: HashSet<String> = HashSet::new();
    let mut attempt: u32 = 0;

    loop {
        match connect(&cfg).await {
            Ok((publisher, pubsub)) => {
                info!("bus connected at {}", cfg.url);
                attempt = 0;
                let (mut sink, mut stream) = pubsub.split();

                if let Err(err) = resubscribe(&mut sink, &active).await {
                    warn!("bus resubscription failed: {err:#}");
                } else {
                    loop {
                        tokio::select! {
                            _ = shutdown.recv() => {
                                info!("bus bridge shutting down");
                                return;
                            }
                            command = commands.recv() => {
                                let Some(command) = command else {
                                    debug!("bus command channel closed, stopping bridge");
                                    return;
                                };
                                match command {
                                    BusCommand::Subscribe(topic) => {
                                        if active.insert(topic.clone()) {
                                            if let Err(err) = sink.psubscribe(inbound_pattern(&topic)).await {
                                                warn!("bus psubscribe for {topic} failed: {err}");
                                                break;
                                            }
                                            debug!("bus subscribed to {}", inbound_pattern(&topic));
                                        }
                                    }
                                    BusCommand::Unsubscribe(topic) => {
                                        if active.remove(&topic) {
                                            if let Err(err) = sink.punsubscribe(inbound_pattern(&topic)).await {
                                                warn!("bus punsubscribe for {topic} failed: {err}");
                                                break;
                                            }
                                            debug!("bus unsubscribed from {}", inbound_pattern(&topic));
                                        }
                                    }
                                    BusCommand::Publish { topic, event, payload } => {
                                        publish(publisher.clone(), &topic, &event, payload);
                                    }
                                }
                            }
                            message = stream.next() => {
                                match message {
                                    Some(message) => handle_bus_message(&hub, message).await,
                                    None => {
                                        warn!("bus pub/sub stream closed");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!("bus connection to {} failed: {err:#}", cfg.url);
            }
        }

        let delay = backoff_delay(&cfg, attempt);
        attempt = attempt.saturating_add(1);
        info!("bus reconnecting in {}ms", delay.as_millis());
        if !wait_for_retry(delay, &mut commands, &mut shutdown, &mut active).await {
            return;
        }
    }
}

async fn connect(cfg: &BusConfig) -> Result<(ConnectionManager, PubSub)> {
    let client = redis::Client::open(cfg.url.as_str())
        .with_context(|| format!("invalid bus url {}", cfg.url))?;
    let publisher = ConnectionManager::new(client.clone())
        .await
        .context("failed connecting bus publisher")?;
    let pubsub = client
        .get_async_pubsub()
        .await
        .context("failed connecting bus subscriber")?;
    Ok((publisher, pubsub))
}

async fn resubscribe(
    sink: &mut redis::aio::PubSubSink,
    active: &HashSet<String>,
) -> Result<()> {
    for topic in active {
        sink.psubscribe(inbound_pattern(topic))
            .await
            .with_context(|| format!("failed restoring bus subscription for {topic}"))?;
        debug!("bus subscription restored for {topic}");
    }
    Ok(())
}

/// Fire-and-forget publish; the bus needs no acknowledgment.
fn publish(mut publisher: ConnectionManager, topic: &str, event: &str, payload: Value) {
    let channel = outbound_channel(topic, event);
    let body = payload.to_string();
    tokio::spawn(async move {
        if let Err(err) = publisher.publish::<_, _, ()>(&channel, body).await {
            warn!("bus publish to {channel} failed, dropping message: {err}");
        }
    });
}

async fn handle_bus_message(hub: &Hub, message: redis::Msg) {
    let channel = message.get_channel_name().to_owned();
    let Ok(pattern) = message.get_pattern::<String>() else {
        debug!("bus message on {channel} without pattern, ignoring");
        return;
    };
    let Some(topic) = topic_of_pattern(&pattern) else {
        warn!("bus message matched unexpected pattern {pattern}");
        return;
    };
    let Some(event) = event_of_channel(&channel, topic) else {
        warn!("bus channel {channel} does not extend pattern {pattern}");
        return;
    };
    let raw: String = match message.get_payload() {
        Ok(raw) => raw,
        Err(err) => {
            warn!("undecodable bus payload on {channel}: {err}");
            return;
        }
    };
    let payload = serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
    hub.deliver_from_bus(topic, event, payload).await;
}

/// Sleeps out the backoff window while keeping the command channel live:
/// subscription bookkeeping stays current for the resubscribe on
/// reconnect, and publishes are dropped instead of buffered. Returns
/// false on shutdown.
async fn wait_for_retry(
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<BusCommand>,
    shutdown: &mut broadcast::Receiver<()>,
    active: &mut HashSet<String>,
) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = shutdown.recv() => return false,
            _ = sleep_until(deadline) => return true,
            command = commands.recv() => {
                match command {
                    None => return false,
                    Some(BusCommand::Subscribe(topic)) => {
                        active.insert(topic);
                    }
                    Some(BusCommand::Unsubscribe(topic)) => {
                        active.remove(&topic);
                    }
                    Some(BusCommand::Publish { topic, event, .. }) => {
                        warn!(
                            "bus unavailable, dropping client push to {}",
                            outbound_channel(&topic, &event)
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use tokio::sync::{broadcast, mpsc};

    use crate::config::BusConfig;

    use super::{
        backoff_delay, event_of_channel, inbound_pattern, outbound_channel, topic_of_pattern,
        wait_for_retry, BusCommand,
    };

    #[test]
    fn channel_naming_follows_the_bus_convention() {
        assert_eq!(inbound_pattern("aircraft:state"), "to:aircraft:state:*");
        assert_eq!(
            outbound_channel("aircraft:state", "set_rate"),
            "from:aircraft:state:set_rate"
        );
    }

    #[test]
    fn topic_and_event_survive_colons_in_topic_names() {
        let pattern = inbound_pattern("rooms:lobby:vip");
        assert_eq!(topic_of_pattern(&pattern), Some("rooms:lobby:vip"));
        assert_eq!(
            event_of_channel("to:rooms:lobby:vip:new_msg", "rooms:lobby:vip"),
            Some("new_msg")
        );
        // event suffixes keep their own colons
        assert_eq!(
            event_of_channel("to:rooms:a:ev:sub", "rooms:a"),
            Some("ev:sub")
        );
    }

    #[test]
    fn malformed_channels_are_rejected() {
        assert_eq!(topic_of_pattern("from:rooms:a:*"), None);
        assert_eq!(topic_of_pattern("to:rooms:a"), None);
        assert_eq!(event_of_channel("to:rooms:a", "rooms:a"), None);
        assert_eq!(event_of_channel("to:other:topic:ev", "rooms:a"), None);
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let cfg = BusConfig {
            url: "redis://localhost".to_owned(),
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 10_000,
        };
        assert_eq!(backoff_delay(&cfg, 0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(&cfg, 4), Duration::from_millis(10_000));
        // no overflow at absurd attempt counts
        assert_eq!(backoff_delay(&cfg, u32::MAX), Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_wait_tracks_subscriptions_and_drops_publishes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let mut active: HashSet<String> = HashSet::new();
        active.insert("stale".to_owned());

        tx.send(BusCommand::Subscribe("fresh".to_owned())).expect("send");
        tx.send(BusCommand::Unsubscribe("stale".to_owned())).expect("send");
        tx.send(BusCommand::Publish {
            topic: "fresh".to_owned(),
            event: "ev".to_owned(),
            payload: serde_json::json!({}),
        })
        .expect("send");

        let resumed = wait_for_retry(
            Duration::from_secs(5),
            &mut rx,
            &mut shutdown_rx,
            &mut active,
        )
        .await;
        assert!(resumed);
        assert!(active.contains("fresh"));
        assert!(!active.contains("stale"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_wait_stops_on_shutdown() {
        let (tx, mut rx) = mpsc::unbounded_channel::<BusCommand>();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let mut active = HashSet::new();
        shutdown_tx.send(()).expect("signal");
        let resumed = wait_for_retry(
            Duration::from_secs(60),
            &mut rx,
            &mut shutdown_rx,
            &mut active,
        )
        .await;
        assert!(!resumed);
        drop(tx);
    }
}
