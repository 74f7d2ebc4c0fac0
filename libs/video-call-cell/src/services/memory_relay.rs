// libs/video-call-cell/src/services/memory_relay.rs
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use super::relay::{RelayEvent, RelayLink, RelaySink, RelayTransport};
use crate::models::CallError;

struct Subscriber {
    id: u64,
    participant_id: String,
    events: mpsc::UnboundedSender<RelayEvent>,
}

#[derive(Default)]
struct HubState {
    scopes: HashMap<String, Vec<Subscriber>>,
    next_id: u64,
    opened: usize,
    unavailable: bool,
}

/// In-process relay hub. Subscriptions to the same scope see each other's
/// broadcasts and presence, the sender included, like the hosted relay does.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    hub: Arc<Mutex<HubState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub that rejects every subscription.
    pub fn unavailable() -> Self {
        let relay = Self::default();
        relay.set_available(false);
        relay
    }

    pub fn set_available(&self, available: bool) {
        if let Ok(mut hub) = self.hub.lock() {
            hub.unavailable = !available;
        }
    }

    /// Subscriptions successfully opened over the hub's lifetime.
    pub fn open_count(&self) -> usize {
        self.hub.lock().map(|hub| hub.opened).unwrap_or_default()
    }

    pub fn subscriber_count(&self, scope: &str) -> usize {
        self.hub
            .lock()
            .map(|hub| hub.scopes.get(scope).map_or(0, Vec::len))
            .unwrap_or_default()
    }

    /// Drop every live subscription of `scope` as a network outage would.
    pub fn disconnect_scope(&self, scope: &str, reason: &str) {
        if let Ok(mut hub) = self.hub.lock() {
            if let Some(subscribers) = hub.scopes.remove(scope) {
                for subscriber in subscribers {
                    let _ = subscriber.events.send(RelayEvent::Disconnected {
                        reason: reason.to_string(),
                    });
                }
            }
        }
    }

    fn lock_hub(&self) -> Result<std::sync::MutexGuard<'_, HubState>, CallError> {
        self.hub
            .lock()
            .map_err(|_| CallError::relay_unavailable("relay hub poisoned"))
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn open(&self, scope: &str, participant_id: &str) -> Result<RelayLink, CallError> {
        let mut hub = self.lock_hub()?;
        if hub.unavailable {
            return Err(CallError::relay_unavailable("relay is not reachable"));
        }

        hub.opened += 1;
        hub.next_id += 1;
        let id = hub.next_id;
        let (tx, rx) = mpsc::unbounded_channel();

        let members = hub.scopes.entry(scope.to_string()).or_default();
        for member in members.iter() {
            let _ = tx.send(RelayEvent::PresenceJoined {
                participant_id: member.participant_id.clone(),
            });
            let _ = member.events.send(RelayEvent::PresenceJoined {
                participant_id: participant_id.to_string(),
            });
        }
        let _ = tx.send(RelayEvent::PresenceJoined {
            participant_id: participant_id.to_string(),
        });
        members.push(Subscriber {
            id,
            participant_id: participant_id.to_string(),
            events: tx,
        });

        debug!("Memory relay: {} joined {} ({} members)", participant_id, scope, members.len());

        Ok(RelayLink {
            sink: Box::new(MemorySink {
                relay: self.clone(),
                scope: scope.to_string(),
                subscriber_id: id,
                participant_id: participant_id.to_string(),
                closed: AtomicBool::new(false),
            }),
            events: rx,
        })
    }
}

struct MemorySink {
    relay: MemoryRelay,
    scope: String,
    subscriber_id: u64,
    participant_id: String,
    closed: AtomicBool,
}

#[async_trait]
impl RelaySink for MemorySink {
    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), CallError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallError::relay_unavailable("subscription closed"));
        }

        let hub = self.relay.lock_hub()?;
        let members = hub
            .scopes
            .get(&self.scope)
            .filter(|members| members.iter().any(|m| m.id == self.subscriber_id))
            .ok_or_else(|| CallError::relay_unavailable("subscription dropped by relay"))?;

        for member in members {
            let _ = member.events.send(RelayEvent::Broadcast {
                event: event.to_string(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let Ok(mut hub) = self.relay.hub.lock() else {
            return;
        };
        if let Some(members) = hub.scopes.get_mut(&self.scope) {
            members.retain(|m| m.id != self.subscriber_id);
            for member in members.iter() {
                let _ = member.events.send(RelayEvent::PresenceLeft {
                    participant_id: self.participant_id.clone(),
                });
            }
            if members.is_empty() {
                hub.scopes.remove(&self.scope);
            }
        }
    }
}
