// libs/video-call-cell/src/services/registry.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::models::{CallError, CallParams, CallSnapshot};
use crate::services::session::{CallDependencies, CallSessionController, Liveness};

pub type SharedController = Arc<Mutex<CallSessionController>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub appointment_id: String,
    pub participant_id: String,
}

impl CallKey {
    pub fn new(appointment_id: impl Into<String>, participant_id: impl Into<String>) -> Self {
        Self {
            appointment_id: appointment_id.into(),
            participant_id: participant_id.into(),
        }
    }
}

impl From<&CallParams> for CallKey {
    fn from(params: &CallParams) -> Self {
        Self::new(params.appointment_id.clone(), params.local_participant_id.clone())
    }
}

/// A hosted controller plus what the registry needs to judge it without
/// taking the controller's lock.
#[derive(Clone)]
struct HostedCall {
    controller: SharedController,
    liveness: Liveness,
    starting: Arc<AtomicBool>,
}

impl HostedCall {
    fn is_active(&self) -> bool {
        self.starting.load(Ordering::Acquire) || self.liveness.is_live()
    }
}

/// Call sessions hosted by this agent, one per (appointment, participant).
/// Capture devices are exclusive, so at most one session is live at a time
/// for each media source the registry hands out. Ended calls stay readable
/// until the next start or until `finish` removes them.
#[derive(Clone, Default)]
pub struct CallRegistry {
    calls: Arc<RwLock<HashMap<CallKey, HostedCall>>>,
    exclusive_media: bool,
}

impl CallRegistry {
    /// Registry whose calls share one capture device.
    pub fn new() -> Self {
        Self {
            calls: Arc::default(),
            exclusive_media: true,
        }
    }

    /// Registry whose calls each get their own media source.
    pub fn with_independent_media() -> Self {
        Self::default()
    }

    pub async fn start(&self, deps: CallDependencies, params: CallParams) -> Result<SharedController, CallError> {
        let key = CallKey::from(&params);
        let controller = CallSessionController::new(deps);
        let hosted = HostedCall {
            liveness: controller.liveness(),
            controller: Arc::new(Mutex::new(controller)),
            starting: Arc::new(AtomicBool::new(true)),
        };
        let mut guard = hosted.controller.clone().lock_owned().await;

        {
            let mut calls = self.calls.write().await;
            let before = calls.len();
            calls.retain(|_, call| call.is_active());
            if calls.len() < before {
                debug!("Dropped {} ended calls", before - calls.len());
            }

            for existing in calls.keys() {
                if self.exclusive_media || *existing == key {
                    warn!(
                        "Call for {} rejected: {} still active",
                        key.appointment_id, existing.appointment_id
                    );
                    return Err(CallError::SessionAlreadyActive {
                        appointment_id: existing.appointment_id.clone(),
                    });
                }
            }
            calls.insert(key.clone(), hosted.clone());
        }

        let started = guard.start(params).await;
        hosted.starting.store(false, Ordering::Release);
        if let Err(err) = started {
            self.calls.write().await.remove(&key);
            return Err(err);
        }

        info!("Call {}/{} registered", key.appointment_id, key.participant_id);
        Ok(hosted.controller)
    }

    pub async fn get(&self, key: &CallKey) -> Result<SharedController, CallError> {
        self.calls
            .read()
            .await
            .get(key)
            .map(|call| call.controller.clone())
            .ok_or(CallError::SessionNotFound)
    }

    pub async fn end(&self, key: &CallKey) -> Result<(), CallError> {
        let controller = self.get(key).await?;
        let mut controller = controller.lock().await;
        controller.end().await
    }

    /// End the call, forget it and hand back its final snapshot.
    pub async fn finish(&self, key: &CallKey) -> Result<Option<CallSnapshot>, CallError> {
        let controller = self.get(key).await?;
        let snapshot = {
            let mut controller = controller.lock().await;
            controller.end().await?;
            controller.snapshot()
        };
        self.remove(key).await;
        debug!("Call {}/{} removed", key.appointment_id, key.participant_id);
        Ok(snapshot)
    }

    pub async fn remove(&self, key: &CallKey) -> Option<SharedController> {
        self.calls.write().await.remove(key).map(|call| call.controller)
    }

    pub async fn len(&self) -> usize {
        self.calls.read().await.len()
    }

    pub async fn live_count(&self) -> usize {
        self.calls
            .read()
            .await
            .values()
            .filter(|call| call.is_active())
            .count()
    }

    /// End every hosted call, used on shutdown.
    pub async fn end_all(&self) {
        let calls: Vec<(CallKey, SharedController)> = self
            .calls
            .read()
            .await
            .iter()
            .map(|(key, call)| (key.clone(), call.controller.clone()))
            .collect();

        for (key, controller) in calls {
            if let Err(err) = controller.lock().await.end().await {
                warn!("Failed to end call {}: {}", key.appointment_id, err);
            }
        }
        debug!("All calls ended");
    }
}
