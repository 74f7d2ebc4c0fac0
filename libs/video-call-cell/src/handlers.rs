// libs/video-call-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use axum_extra::TypedHeader;
use headers::{authorization::Bearer, Authorization};
use serde_json::{json, Value};
use tracing::info;

use shared_config::{AppConfig, NegotiationMode};
use shared_models::error::AppError;

use crate::models::{CallError, ChatMessageRequest, ConsultationReportRequest, StartCallRequest};
use crate::services::provider::DependencyProvider;
use crate::services::registry::{CallKey, CallRegistry, SharedController};

/// Shared state of the call agent routes.
pub struct CallAgentState {
    pub config: Arc<AppConfig>,
    pub registry: CallRegistry,
    pub provider: Arc<dyn DependencyProvider>,
}

impl CallAgentState {
    pub fn new(config: Arc<AppConfig>, registry: CallRegistry, provider: Arc<dyn DependencyProvider>) -> Self {
        Self {
            config,
            registry,
            provider,
        }
    }
}

fn map_call_error(err: CallError) -> AppError {
    match err {
        CallError::MediaUnavailable { .. } | CallError::RelayUnavailable { .. } => AppError::Unavailable {
            kind: err.kind().to_string(),
            message: err.to_string(),
        },
        CallError::InvalidSignal { message } => AppError::BadRequest(message),
        CallError::ChannelNotReady | CallError::NoActiveMedia | CallError::SessionAlreadyActive { .. } => {
            AppError::Conflict(err.to_string())
        }
        CallError::NotCallOwner => AppError::Forbidden(err.to_string()),
        CallError::SessionNotFound => AppError::NotFound("Call session not found".to_string()),
        CallError::ConnectionFailed { .. } | CallError::AppointmentStore { .. } => {
            AppError::ExternalService(err.to_string())
        }
        CallError::Internal { message } => AppError::Internal(message),
    }
}

async fn lookup(state: &CallAgentState, appointment_id: String, participant_id: String) -> Result<SharedController, AppError> {
    state
        .registry
        .get(&CallKey::new(appointment_id, participant_id))
        .await
        .map_err(map_call_error)
}

// ==============================================================================
// HEALTH
// ==============================================================================

pub async fn call_health_check(State(state): State<Arc<CallAgentState>>) -> Json<Value> {
    let negotiation = match state.config.negotiation_mode {
        NegotiationMode::WebRtc => "webrtc",
        NegotiationMode::Loopback => "loopback",
    };

    Json(json!({
        "status": if state.config.is_configured() { "healthy" } else { "not_configured" },
        "service": "video-call-cell",
        "negotiation": negotiation,
        "relay_configured": state.config.is_relay_configured(),
        "active_calls": state.registry.live_count().await,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

// ==============================================================================
// CALL LIFECYCLE HANDLERS
// ==============================================================================

/// Start the local side of an appointment's call
#[axum::debug_handler]
pub async fn start_call(
    State(state): State<Arc<CallAgentState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(request): Json<StartCallRequest>,
) -> Result<Json<Value>, AppError> {
    if request.appointment_id.trim().is_empty() || request.participant_id.trim().is_empty() {
        return Err(AppError::BadRequest(
            "appointment_id and participant_id are required".to_string(),
        ));
    }

    let params = request.into_params();
    info!(
        "Starting call for appointment {} as {:?}",
        params.appointment_id, params.role
    );

    let deps = state.provider.dependencies(Some(auth.token()));
    let controller = state
        .registry
        .start(deps, params)
        .await
        .map_err(map_call_error)?;
    let snapshot = controller.lock().await.snapshot();

    Ok(Json(json!({
        "success": true,
        "call": snapshot,
        "message": "Call started"
    })))
}

pub async fn get_call(
    State(state): State<Arc<CallAgentState>>,
    Path((appointment_id, participant_id)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    let controller = lookup(&state, appointment_id, participant_id).await?;
    let snapshot = controller.lock().await.snapshot();

    Ok(Json(json!({
        "success": true,
        "call": snapshot
    })))
}

pub async fn toggle_mute(
    State(state): State<Arc<CallAgentState>>,
    Path((appointment_id, participant_id)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    let controller = lookup(&state, appointment_id, participant_id).await?;
    let muted = controller.lock().await.toggle_mute().await.map_err(map_call_error)?;

    Ok(Json(json!({
        "success": true,
        "muted": muted
    })))
}

pub async fn toggle_camera(
    State(state): State<Arc<CallAgentState>>,
    Path((appointment_id, participant_id)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    let controller = lookup(&state, appointment_id, participant_id).await?;
    let camera_off = controller
        .lock()
        .await
        .toggle_camera()
        .await
        .map_err(map_call_error)?;

    Ok(Json(json!({
        "success": true,
        "camera_off": camera_off
    })))
}

pub async fn send_chat_message(
    State(state): State<Arc<CallAgentState>>,
    Path((appointment_id, participant_id)): Path<(String, String)>,
    Json(request): Json<ChatMessageRequest>,
) -> Result<Json<Value>, AppError> {
    let controller = lookup(&state, appointment_id, participant_id).await?;
    let controller = controller.lock().await;
    controller
        .send_chat_message(&request.text)
        .await
        .map_err(map_call_error)?;

    Ok(Json(json!({
        "success": true,
        "call": controller.snapshot()
    })))
}

/// Doctor-only: end the call and complete the appointment with a report
pub async fn submit_report(
    State(state): State<Arc<CallAgentState>>,
    Path((appointment_id, participant_id)): Path<(String, String)>,
    Json(request): Json<ConsultationReportRequest>,
) -> Result<Json<Value>, AppError> {
    if request.report.trim().is_empty() {
        return Err(AppError::BadRequest("report must not be empty".to_string()));
    }

    let controller = lookup(&state, appointment_id, participant_id).await?;
    let mut controller = controller.lock().await;
    controller
        .complete_with_report(&request.report)
        .await
        .map_err(map_call_error)?;

    Ok(Json(json!({
        "success": true,
        "call": controller.snapshot(),
        "message": "Consultation report saved"
    })))
}

/// End the call and release its registry entry
pub async fn end_call(
    State(state): State<Arc<CallAgentState>>,
    Path((appointment_id, participant_id)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    let key = CallKey::new(appointment_id, participant_id);
    let snapshot = state.registry.finish(&key).await.map_err(map_call_error)?;

    Ok(Json(json!({
        "success": true,
        "call": snapshot,
        "message": "Call ended"
    })))
}
