// libs/video-call-cell/src/services/appointments.rs
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::models::{AppointmentStatus, CallError};

/// Write access to the appointment record a call belongs to.
#[async_trait]
pub trait AppointmentStatusStore: Send + Sync {
    async fn update_status(
        &self,
        appointment_id: &str,
        status: AppointmentStatus,
        notes: Option<&str>,
    ) -> Result<(), CallError>;
}

/// Appointment store backed by the Supabase `appointments` table.
pub struct SupabaseAppointmentStore {
    supabase: Arc<SupabaseClient>,
    auth_token: Option<String>,
}

impl SupabaseAppointmentStore {
    pub fn new(config: &AppConfig, auth_token: Option<String>) -> Self {
        Self {
            supabase: Arc::new(SupabaseClient::new(config)),
            auth_token,
        }
    }
}

#[async_trait]
impl AppointmentStatusStore for SupabaseAppointmentStore {
    async fn update_status(
        &self,
        appointment_id: &str,
        status: AppointmentStatus,
        notes: Option<&str>,
    ) -> Result<(), CallError> {
        debug!("Updating appointment {} to {}", appointment_id, status.as_str());

        let mut body = json!({ "status": status });
        if let Some(notes) = notes {
            body["notes"] = Value::String(notes.to_string());
        }

        let rows = self
            .supabase
            .patch_rows(
                "appointments",
                &format!("id=eq.{}", appointment_id),
                self.auth_token.as_deref(),
                body,
            )
            .await
            .map_err(|e| {
                error!("Failed to update appointment {}: {}", appointment_id, e);
                CallError::AppointmentStore {
                    message: e.to_string(),
                }
            })?;

        if rows.is_empty() {
            warn!("Appointment {} not updated: no matching row", appointment_id);
            return Err(CallError::AppointmentStore {
                message: format!("appointment {} not found or not writable", appointment_id),
            });
        }

        info!("Appointment {} marked {}", appointment_id, status.as_str());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub appointment_id: String,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
}

/// Keeps status writes in memory. Serves agents running without a database
/// and lets tests count writes.
#[derive(Default)]
pub struct InMemoryAppointmentStore {
    updates: Mutex<Vec<StatusUpdate>>,
    failure: Option<String>,
}

impl InMemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects every write with `reason`.
    pub fn failing(reason: &str) -> Self {
        Self {
            updates: Mutex::new(Vec::new()),
            failure: Some(reason.to_string()),
        }
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn count(&self, appointment_id: &str, status: AppointmentStatus) -> usize {
        self.updates()
            .iter()
            .filter(|u| u.appointment_id == appointment_id && u.status == status)
            .count()
    }
}

#[async_trait]
impl AppointmentStatusStore for InMemoryAppointmentStore {
    async fn update_status(
        &self,
        appointment_id: &str,
        status: AppointmentStatus,
        notes: Option<&str>,
    ) -> Result<(), CallError> {
        if let Some(reason) = &self.failure {
            return Err(CallError::AppointmentStore {
                message: reason.clone(),
            });
        }

        info!("Recording appointment {} as {}", appointment_id, status.as_str());
        self.updates
            .lock()
            .map_err(|_| CallError::Internal {
                message: "appointment store poisoned".to_string(),
            })?
            .push(StatusUpdate {
                appointment_id: appointment_id.to_string(),
                status,
                notes: notes.map(str::to_string),
            });
        Ok(())
    }
}
