// libs/video-call-cell/src/services/realtime.rs
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use shared_config::AppConfig;

use super::relay::{RelayEvent, RelayLink, RelaySink, RelayTransport};
use crate::models::CallError;

// ==============================================================================
// PHOENIX CHANNEL PROTOCOL
// ==============================================================================

/// One frame of the Phoenix channel protocol spoken by Supabase Realtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

pub fn topic_for(scope: &str) -> String {
    format!("realtime:{}", scope)
}

pub fn join_message(
    topic: &str,
    participant_id: &str,
    access_token: Option<&str>,
    reference: &str,
) -> PhoenixMessage {
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false, "ack": false },
            "presence": { "key": participant_id },
            "private": false
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }

    PhoenixMessage {
        topic: topic.to_string(),
        event: "phx_join".to_string(),
        payload,
        reference: Some(reference.to_string()),
        join_ref: Some(reference.to_string()),
    }
}

pub fn broadcast_message(topic: &str, event: &str, payload: Value, reference: &str, join_ref: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: topic.to_string(),
        event: "broadcast".to_string(),
        payload: json!({ "type": "broadcast", "event": event, "payload": payload }),
        reference: Some(reference.to_string()),
        join_ref: Some(join_ref.to_string()),
    }
}

pub fn track_message(topic: &str, reference: &str, join_ref: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: topic.to_string(),
        event: "presence".to_string(),
        payload: json!({
            "type": "presence",
            "event": "track",
            "payload": { "online_at": Utc::now().to_rfc3339() }
        }),
        reference: Some(reference.to_string()),
        join_ref: Some(join_ref.to_string()),
    }
}

pub fn heartbeat_message(reference: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: "phoenix".to_string(),
        event: "heartbeat".to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
        join_ref: None,
    }
}

pub fn leave_message(topic: &str, reference: &str, join_ref: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: topic.to_string(),
        event: "phx_leave".to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
        join_ref: Some(join_ref.to_string()),
    }
}

/// Outcome of a `phx_reply` to the frame sent with `reference`, if `message`
/// is that reply.
pub fn reply_status(message: &PhoenixMessage, reference: &str) -> Option<Result<(), String>> {
    if message.event != "phx_reply" || message.reference.as_deref() != Some(reference) {
        return None;
    }

    match message.payload.get("status").and_then(Value::as_str) {
        Some("ok") => Some(Ok(())),
        _ => {
            let reason = message
                .payload
                .pointer("/response/reason")
                .and_then(Value::as_str)
                .unwrap_or("join rejected by relay");
            Some(Err(reason.to_string()))
        }
    }
}

/// Relay events carried by one inbound frame of `topic`.
pub fn decode_frame(message: &PhoenixMessage, topic: &str) -> Vec<RelayEvent> {
    if message.topic != topic {
        return Vec::new();
    }

    let presence_keys = |value: Option<&Value>| -> Vec<String> {
        value
            .and_then(Value::as_object)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    };

    match message.event.as_str() {
        "broadcast" => {
            let Some(event) = message.payload.get("event").and_then(Value::as_str) else {
                return Vec::new();
            };
            vec![RelayEvent::Broadcast {
                event: event.to_string(),
                payload: message.payload.get("payload").cloned().unwrap_or(Value::Null),
            }]
        }
        "presence_state" => presence_keys(Some(&message.payload))
            .into_iter()
            .map(|participant_id| RelayEvent::PresenceJoined { participant_id })
            .collect(),
        "presence_diff" => {
            let mut events: Vec<RelayEvent> = presence_keys(message.payload.get("joins"))
                .into_iter()
                .map(|participant_id| RelayEvent::PresenceJoined { participant_id })
                .collect();
            events.extend(
                presence_keys(message.payload.get("leaves"))
                    .into_iter()
                    .map(|participant_id| RelayEvent::PresenceLeft { participant_id }),
            );
            events
        }
        "phx_error" => vec![RelayEvent::Disconnected {
            reason: "relay channel crashed".to_string(),
        }],
        "phx_close" => vec![RelayEvent::Disconnected {
            reason: "relay channel closed by server".to_string(),
        }],
        "system" if message.payload.get("status").and_then(Value::as_str) == Some("error") => {
            vec![RelayEvent::Disconnected {
                reason: message
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("relay reported an error")
                    .to_string(),
            }]
        }
        _ => Vec::new(),
    }
}

fn encode(message: &PhoenixMessage) -> Result<Message, CallError> {
    serde_json::to_string(message)
        .map(Message::Text)
        .map_err(|e| CallError::Internal {
            message: format!("failed to encode relay frame: {}", e),
        })
}

fn next_ref(counter: &AtomicU64) -> String {
    counter.fetch_add(1, Ordering::SeqCst).to_string()
}

// ==============================================================================
// SUPABASE REALTIME TRANSPORT
// ==============================================================================

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: String,
    pub access_token: Option<String>,
    pub join_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl RealtimeConfig {
    pub fn from_app_config(config: &AppConfig, access_token: Option<String>) -> Self {
        Self {
            url: config.realtime_url(),
            access_token,
            join_timeout: Duration::from_secs(config.relay_join_timeout_secs.max(1)),
            heartbeat_interval: Duration::from_secs(config.relay_heartbeat_secs.max(1)),
        }
    }
}

/// Relay over a Supabase Realtime channel: broadcast for signaling and
/// presence for participant tracking.
pub struct SupabaseRealtimeTransport {
    config: RealtimeConfig,
}

impl SupabaseRealtimeTransport {
    pub fn new(config: RealtimeConfig) -> Self {
        Self { config }
    }

    pub fn from_app_config(config: &AppConfig, access_token: Option<String>) -> Self {
        Self::new(RealtimeConfig::from_app_config(config, access_token))
    }
}

#[async_trait]
impl RelayTransport for SupabaseRealtimeTransport {
    async fn open(&self, scope: &str, participant_id: &str) -> Result<RelayLink, CallError> {
        let topic = topic_for(scope);
        let join_timeout = self.config.join_timeout;

        let (socket, _) = timeout(join_timeout, connect_async(self.config.url.as_str()))
            .await
            .map_err(|_| CallError::relay_unavailable("timed out connecting to realtime"))?
            .map_err(|e| {
                error!("Realtime websocket connection failed: {}", e);
                CallError::relay_unavailable(format!("websocket connection failed: {}", e))
            })?;
        let (mut writer, mut reader) = socket.split();

        let refs = Arc::new(AtomicU64::new(1));
        let join_ref = next_ref(&refs);
        let join = join_message(&topic, participant_id, self.config.access_token.as_deref(), &join_ref);
        writer
            .send(encode(&join)?)
            .await
            .map_err(|e| CallError::relay_unavailable(format!("failed to send join: {}", e)))?;

        let acknowledged = timeout(join_timeout, async {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let Ok(message) = serde_json::from_str::<PhoenixMessage>(&text) else {
                            continue;
                        };
                        if let Some(status) = reply_status(&message, &join_ref) {
                            return status;
                        }
                    }
                    Ok(Message::Close(_)) => return Err("socket closed during join".to_string()),
                    Ok(_) => {}
                    Err(e) => return Err(e.to_string()),
                }
            }
            Err("socket ended during join".to_string())
        })
        .await;

        match acknowledged {
            Ok(Ok(())) => info!("Joined realtime topic {}", topic),
            Ok(Err(reason)) => {
                warn!("Realtime join of {} failed: {}", topic, reason);
                return Err(CallError::relay_unavailable(reason));
            }
            Err(_) => {
                warn!("Realtime join of {} not acknowledged in {:?}", topic, join_timeout);
                return Err(CallError::relay_unavailable("join not acknowledged in time"));
            }
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let heartbeat_period = self.config.heartbeat_interval;
        let heartbeat_refs = refs.clone();
        let writer_task = tokio::spawn(async move {
            let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
            loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => {
                        let Some(message) = outbound else { break };
                        let closing = matches!(message, Message::Close(_));
                        if let Err(e) = writer.send(message).await {
                            warn!("Realtime write failed: {}", e);
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    _ = heartbeat.tick() => {
                        let Ok(frame) = encode(&heartbeat_message(&next_ref(&heartbeat_refs))) else {
                            continue;
                        };
                        if let Err(e) = writer.send(frame).await {
                            warn!("Realtime heartbeat failed: {}", e);
                            break;
                        }
                    }
                }
            }
            debug!("Realtime writer stopped");
        });

        let reader_topic = topic.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<PhoenixMessage>(&text) {
                        Ok(message) => {
                            for event in decode_frame(&message, &reader_topic) {
                                if events_tx.send(event).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!("Ignoring unparseable realtime frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Realtime socket error: {}", e);
                        break;
                    }
                }
            }
            let _ = events_tx.send(RelayEvent::Disconnected {
                reason: "realtime socket closed".to_string(),
            });
        });

        let track = track_message(&topic, &next_ref(&refs), &join_ref);
        outbound_tx
            .send(encode(&track)?)
            .map_err(|_| CallError::relay_unavailable("realtime writer stopped"))?;

        Ok(RelayLink {
            sink: Box::new(RealtimeSink {
                topic,
                join_ref,
                refs,
                outbound: outbound_tx,
                closed: AtomicBool::new(false),
                reader: reader_task,
                writer: writer_task,
            }),
            events: events_rx,
        })
    }
}

struct RealtimeSink {
    topic: String,
    join_ref: String,
    refs: Arc<AtomicU64>,
    outbound: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

#[async_trait]
impl RelaySink for RealtimeSink {
    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), CallError> {
        if self.closed.load(Ordering::SeqCst) || self.writer.is_finished() {
            return Err(CallError::relay_unavailable("realtime channel closed"));
        }

        let frame = broadcast_message(&self.topic, event, payload, &next_ref(&self.refs), &self.join_ref);
        self.outbound
            .send(encode(&frame)?)
            .map_err(|_| CallError::relay_unavailable("realtime writer stopped"))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let leave = leave_message(&self.topic, &next_ref(&self.refs), &self.join_ref);
        if let Ok(frame) = encode(&leave) {
            let _ = self.outbound.send(frame);
        }
        let _ = self.outbound.send(Message::Close(None));
        self.reader.abort();
        debug!("Left realtime topic {}", self.topic);
    }
}

impl Drop for RealtimeSink {
    fn drop(&mut self) {
        // writer drains queued frames and exits once the channel closes
        self.reader.abort();
    }
}
