// libs/video-call-cell/src/services/relay.rs
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::{CallError, SignalKind, SignalingEnvelope};

/// Broadcast event name carrying negotiation data.
pub const SIGNAL_EVENT: &str = "signal";

/// Relay scope shared by the two participants of an appointment's call.
pub fn session_key(appointment_id: &str) -> String {
    format!("call:{}", appointment_id)
}

/// Raw event surfaced by a relay transport for one subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Broadcast { event: String, payload: Value },
    PresenceJoined { participant_id: String },
    PresenceLeft { participant_id: String },
    Disconnected { reason: String },
}

/// Outbound half of a relay subscription.
#[async_trait]
pub trait RelaySink: Send + Sync {
    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), CallError>;
    async fn close(&self);
}

pub struct RelayLink {
    pub sink: Box<dyn RelaySink>,
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
}

/// Publish/subscribe primitive with scoped channels, broadcast and presence.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn open(&self, scope: &str, participant_id: &str) -> Result<RelayLink, CallError>;
}

/// What a call session observes from its relay subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayNotice {
    Signal(SignalingEnvelope),
    Presence { participant_id: String },
    PresenceLeft { participant_id: String },
    Lost { reason: String },
    /// A `signal` broadcast that could not be decoded. The subscription stays usable.
    Invalid(CallError),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalWire {
    sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<SignalKind>,
    signal_data: Value,
}

pub fn encode_envelope(envelope: &SignalingEnvelope) -> Value {
    serde_json::json!({
        "senderId": envelope.sender_id,
        "kind": envelope.kind,
        "signalData": envelope.payload,
    })
}

/// Parse a `signal` broadcast body. Clients that only send
/// `{senderId, signalData}` get their kind inferred from the payload.
pub fn decode_envelope(payload: Value) -> Result<SignalingEnvelope, CallError> {
    let wire: SignalWire = serde_json::from_value(payload)
        .map_err(|e| CallError::invalid_signal(format!("malformed envelope: {}", e)))?;

    let kind = wire
        .kind
        .or_else(|| SignalKind::infer(&wire.signal_data))
        .ok_or_else(|| CallError::invalid_signal("envelope does not identify its signal kind"))?;

    Ok(SignalingEnvelope {
        sender_id: wire.sender_id,
        kind,
        payload: wire.signal_data,
    })
}

/// Signaling client bound to one relay scope and one local participant.
pub struct SignalingRelayClient {
    scope: String,
    local_participant_id: String,
    sink: Box<dyn RelaySink>,
    events: mpsc::UnboundedReceiver<RelayEvent>,
    closed: bool,
    drained: bool,
}

impl fmt::Debug for SignalingRelayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingRelayClient")
            .field("scope", &self.scope)
            .field("local_participant_id", &self.local_participant_id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl SignalingRelayClient {
    pub async fn open(
        transport: &dyn RelayTransport,
        scope: &str,
        local_participant_id: &str,
    ) -> Result<Self, CallError> {
        let link = transport
            .open(scope, local_participant_id)
            .await
            .map_err(|err| match err {
                CallError::RelayUnavailable { .. } => err,
                other => CallError::relay_unavailable(other.to_string()),
            })?;

        info!("Subscribed to relay scope {} as {}", scope, local_participant_id);

        Ok(Self {
            scope: scope.to_string(),
            local_participant_id: local_participant_id.to_string(),
            sink: link.sink,
            events: link.events,
            closed: false,
            drained: false,
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Best-effort broadcast to the other subscribers of the scope.
    pub async fn send(&self, envelope: &SignalingEnvelope) -> Result<(), CallError> {
        if self.closed {
            return Err(CallError::relay_unavailable("relay subscription already closed"));
        }

        debug!("Sending {:?} signal on {}", envelope.kind, self.scope);
        self.sink.broadcast(SIGNAL_EVENT, encode_envelope(envelope)).await
    }

    /// Next notice for the session. Envelopes sent by the local participant
    /// are discarded here; undecodable ones surface as `Invalid`. Never
    /// resolves once the subscription is closed or its loss has been reported.
    pub async fn next_event(&mut self) -> Option<RelayNotice> {
        if self.closed || self.drained {
            return std::future::pending().await;
        }

        loop {
            let Some(event) = self.events.recv().await else {
                self.drained = true;
                return Some(RelayNotice::Lost {
                    reason: "relay event stream ended".to_string(),
                });
            };

            match event {
                RelayEvent::Broadcast { event, payload } => {
                    if event != SIGNAL_EVENT {
                        debug!("Ignoring relay broadcast '{}'", event);
                        continue;
                    }

                    match decode_envelope(payload) {
                        Ok(envelope) if envelope.sender_id == self.local_participant_id => {
                            continue;
                        }
                        Ok(envelope) => return Some(RelayNotice::Signal(envelope)),
                        Err(err) => {
                            warn!("Undecodable envelope on {}: {}", self.scope, err);
                            return Some(RelayNotice::Invalid(err));
                        }
                    }
                }
                RelayEvent::PresenceJoined { participant_id } => {
                    return Some(RelayNotice::Presence { participant_id });
                }
                RelayEvent::PresenceLeft { participant_id } => {
                    if participant_id == self.local_participant_id {
                        continue;
                    }
                    return Some(RelayNotice::PresenceLeft { participant_id });
                }
                RelayEvent::Disconnected { reason } => {
                    self.drained = true;
                    return Some(RelayNotice::Lost { reason });
                }
            }
        }
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.sink.close().await;
        self.events.close();
        info!("Left relay scope {}", self.scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_key_is_scoped_by_appointment() {
        assert_eq!(session_key("appt-1"), "call:appt-1");
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = SignalingEnvelope::new(
            "doctor-1",
            SignalKind::Offer,
            json!({ "type": "offer", "sdp": "v=0" }),
        );
        let wire = encode_envelope(&envelope);
        assert_eq!(wire["senderId"], "doctor-1");
        assert_eq!(wire["kind"], "offer");
        assert_eq!(wire["signalData"]["sdp"], "v=0");
        assert_eq!(decode_envelope(wire).unwrap(), envelope);
    }

    #[test]
    fn test_envelope_without_kind_is_inferred() {
        let envelope = decode_envelope(json!({
            "senderId": "parent-1",
            "signalData": { "type": "answer", "sdp": "v=0" }
        }))
        .unwrap();
        assert_eq!(envelope.kind, SignalKind::Answer);
    }

    #[test]
    fn test_envelope_without_sender_is_rejected() {
        let err = decode_envelope(json!({ "signalData": { "type": "offer" } })).unwrap_err();
        assert_eq!(err.kind(), "invalid_signal");
    }
}
