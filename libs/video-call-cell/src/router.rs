// libs/video-call-cell/src/router.rs
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::*;

/// Creates the call agent routes
pub fn video_call_routes(state: Arc<CallAgentState>) -> Router {
    Router::new()
        .route("/health", get(call_health_check))
        .route("/calls", post(start_call))
        .route(
            "/calls/{appointment_id}/{participant_id}",
            get(get_call).delete(end_call),
        )
        .route("/calls/{appointment_id}/{participant_id}/mute", post(toggle_mute))
        .route("/calls/{appointment_id}/{participant_id}/camera", post(toggle_camera))
        .route("/calls/{appointment_id}/{participant_id}/chat", post(send_chat_message))
        .route("/calls/{appointment_id}/{participant_id}/report", post(submit_report))
        .with_state(state)
}
