// libs/video-call-cell/src/services/loopback.rs
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::peer::{EngineEvent, EngineFactory, EngineFault, NegotiationEngine, PeerConfig};
use crate::media::{RemoteStream, TrackKind};
use crate::models::{CallError, SignalKind};

const SDP_PREFIX: &str = "loopback:";

struct Endpoint {
    events: mpsc::UnboundedSender<EngineEvent>,
    stream_id: String,
    kinds: Vec<TrackKind>,
    peer: Option<String>,
}

/// In-process negotiation network. Engines created from the same network
/// connect to each other once their offer and answer have gone through the
/// relay, so the full signaling path is exercised without a media stack.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    endpoints: Arc<Mutex<HashMap<String, Endpoint>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().map(|e| e.len()).unwrap_or_default()
    }

    fn contains(&self, id: &str) -> bool {
        self.endpoints
            .lock()
            .map(|e| e.contains_key(id))
            .unwrap_or_default()
    }

    /// Pair two endpoints and hand each the other's media and an open channel.
    fn link(&self, a: &str, b: &str) -> Result<(), String> {
        let mut endpoints = self
            .endpoints
            .lock()
            .map_err(|_| "loopback network poisoned".to_string())?;

        let (a_stream, a_kinds) = endpoints
            .get(a)
            .map(|e| (e.stream_id.clone(), e.kinds.clone()))
            .ok_or_else(|| format!("endpoint {} is gone", a))?;
        let (b_stream, b_kinds) = endpoints
            .get(b)
            .map(|e| (e.stream_id.clone(), e.kinds.clone()))
            .ok_or_else(|| format!("endpoint {} is gone", b))?;

        if let Some(endpoint) = endpoints.get_mut(a) {
            endpoint.peer = Some(b.to_string());
            let _ = endpoint.events.send(EngineEvent::RemoteStream(RemoteStream {
                id: b_stream,
                kinds: b_kinds,
            }));
            let _ = endpoint.events.send(EngineEvent::ChannelOpen);
        }
        if let Some(endpoint) = endpoints.get_mut(b) {
            endpoint.peer = Some(a.to_string());
            let _ = endpoint.events.send(EngineEvent::RemoteStream(RemoteStream {
                id: a_stream,
                kinds: a_kinds,
            }));
            let _ = endpoint.events.send(EngineEvent::ChannelOpen);
        }

        debug!("Loopback endpoints {} and {} linked", a, b);
        Ok(())
    }

    fn deliver(&self, from: &str, data: Bytes) -> Result<(), String> {
        let endpoints = self
            .endpoints
            .lock()
            .map_err(|_| "loopback network poisoned".to_string())?;

        let peer = endpoints
            .get(from)
            .and_then(|e| e.peer.as_ref())
            .ok_or_else(|| "no linked peer".to_string())?;
        let target = endpoints
            .get(peer)
            .ok_or_else(|| "linked peer is gone".to_string())?;

        target
            .events
            .send(EngineEvent::Data(data))
            .map_err(|_| "linked peer stopped listening".to_string())
    }

    fn unregister(&self, id: &str) {
        let Ok(mut endpoints) = self.endpoints.lock() else {
            return;
        };
        let Some(peer_id) = endpoints.remove(id).and_then(|endpoint| endpoint.peer) else {
            return;
        };
        if let Some(peer) = endpoints.get_mut(&peer_id) {
            peer.peer = None;
            let _ = peer.events.send(EngineEvent::Closed);
        }
    }
}

#[async_trait]
impl EngineFactory for LoopbackNetwork {
    async fn create(
        &self,
        config: PeerConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Box<dyn NegotiationEngine>, CallError> {
        let id = Uuid::new_v4().to_string();
        let kinds = config.local_stream.tracks().iter().map(|t| t.kind()).collect();

        self.endpoints
            .lock()
            .map_err(|_| CallError::Internal {
                message: "loopback network poisoned".to_string(),
            })?
            .insert(
                id.clone(),
                Endpoint {
                    events: events.clone(),
                    stream_id: config.local_stream.id().to_string(),
                    kinds,
                    peer: None,
                },
            );

        Ok(Box::new(LoopbackEngine {
            id,
            network: self.clone(),
            is_initiator: config.is_initiator,
            events,
            phase: Phase::New,
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    New,
    OfferSent,
    Answered,
    Linked,
    Destroyed,
}

struct LoopbackEngine {
    id: String,
    network: LoopbackNetwork,
    is_initiator: bool,
    events: mpsc::UnboundedSender<EngineEvent>,
    phase: Phase,
}

impl LoopbackEngine {
    fn description(&self, kind: &str) -> Value {
        json!({ "type": kind, "sdp": format!("{}{}", SDP_PREFIX, self.id) })
    }

    fn remote_endpoint(kind: SignalKind, payload: &Value) -> Result<String, EngineFault> {
        let expected = match kind {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        };
        if payload.get("type").and_then(Value::as_str) != Some(expected) {
            return Err(EngineFault::Malformed(format!("expected a {} description", expected)));
        }

        payload
            .get("sdp")
            .and_then(Value::as_str)
            .and_then(|sdp| sdp.strip_prefix(SDP_PREFIX))
            .map(str::to_string)
            .ok_or_else(|| EngineFault::Malformed("unrecognized session description".to_string()))
    }
}

#[async_trait]
impl NegotiationEngine for LoopbackEngine {
    async fn start(&mut self) -> Result<(), EngineFault> {
        if !self.is_initiator {
            return Ok(());
        }

        self.events
            .send(EngineEvent::Signal {
                kind: SignalKind::Offer,
                payload: self.description("offer"),
            })
            .map_err(|_| EngineFault::Fatal("peer manager stopped listening".to_string()))?;
        self.phase = Phase::OfferSent;
        Ok(())
    }

    async fn apply_signal(&mut self, kind: SignalKind, payload: Value) -> Result<(), EngineFault> {
        if self.phase == Phase::Destroyed {
            return Err(EngineFault::Fatal("engine destroyed".to_string()));
        }

        match (kind, self.is_initiator) {
            (SignalKind::Candidate, _) => Ok(()),
            (SignalKind::Offer, false) => {
                if self.phase != Phase::New {
                    return Err(EngineFault::Malformed("offer already answered".to_string()));
                }
                let remote = Self::remote_endpoint(kind, &payload)?;
                if !self.network.contains(&remote) {
                    return Err(EngineFault::Malformed(format!("unknown endpoint {}", remote)));
                }

                self.events
                    .send(EngineEvent::Signal {
                        kind: SignalKind::Answer,
                        payload: self.description("answer"),
                    })
                    .map_err(|_| EngineFault::Fatal("peer manager stopped listening".to_string()))?;
                self.phase = Phase::Answered;
                Ok(())
            }
            (SignalKind::Answer, true) => {
                if self.phase != Phase::OfferSent {
                    return Err(EngineFault::Malformed("no offer awaiting an answer".to_string()));
                }
                let remote = Self::remote_endpoint(kind, &payload)?;
                self.network.link(&self.id, &remote).map_err(EngineFault::Fatal)?;
                self.phase = Phase::Linked;
                Ok(())
            }
            (SignalKind::Offer, true) => Err(EngineFault::Malformed(
                "initiator does not accept offers".to_string(),
            )),
            (SignalKind::Answer, false) => Err(EngineFault::Malformed(
                "responder does not accept answers".to_string(),
            )),
        }
    }

    async fn send_data(&self, data: Bytes) -> Result<(), String> {
        self.network.deliver(&self.id, data)
    }

    async fn destroy(&mut self) {
        if self.phase == Phase::Destroyed {
            return;
        }
        self.phase = Phase::Destroyed;
        self.network.unregister(&self.id);
    }
}
