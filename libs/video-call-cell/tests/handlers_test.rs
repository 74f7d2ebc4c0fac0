use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use shared_utils::test_utils::{test_appointment_id, TestConfig, TestParticipant};
use video_call_cell::handlers::CallAgentState;
use video_call_cell::models::CallState;
use video_call_cell::services::registry::CallKey;
use video_call_cell::services::{CallRegistry, ConfiguredDependencies};
use video_call_cell::video_call_routes;

fn create_test_app() -> (Router, Arc<CallAgentState>) {
    // no database: status writes land in the offline store
    let config = TestConfig::with_supabase_url("").to_arc();
    let provider = Arc::new(ConfiguredDependencies::from_config(config.clone()));
    let state = Arc::new(CallAgentState::new(
        config,
        CallRegistry::with_independent_media(),
        provider,
    ));
    (video_call_routes(state.clone()), state)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>, token: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn start_body(appointment_id: &str, participant: &TestParticipant) -> Value {
    json!({
        "appointment_id": appointment_id,
        "participant_id": participant.id,
        "profile_role": participant.role,
        "display_name": participant.full_name,
    })
}

#[tokio::test]
async fn test_health_check_reports_mode() {
    let (app, _) = create_test_app();

    let (status, body) = send(&app, Method::GET, "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "video-call-cell");
    assert_eq!(body["negotiation"], "loopback");
    assert_eq!(body["status"], "not_configured");
    assert_eq!(body["active_calls"], 0);
}

#[tokio::test]
async fn test_start_call_requires_bearer_token() {
    let (app, _) = create_test_app();
    let doctor = TestParticipant::doctor("Dr. Amina Diallo");

    let (status, _) = send(
        &app,
        Method::POST,
        "/calls",
        Some(start_body(&test_appointment_id(), &doctor)),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_start_call_rejects_blank_ids() {
    let (app, _) = create_test_app();
    let doctor = TestParticipant::doctor("Dr. Amina Diallo").with_id("  ");

    let (status, body) = send(
        &app,
        Method::POST,
        "/calls",
        Some(start_body(&test_appointment_id(), &doctor)),
        Some("token"),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "bad_request");
}

#[tokio::test]
async fn test_unknown_call_is_not_found() {
    let (app, _) = create_test_app();

    let (status, body) = send(&app, Method::GET, "/calls/missing/nobody", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, _) = send(&app, Method::POST, "/calls/missing/nobody/mute", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_consultation_flow() {
    let (app, state) = create_test_app();
    let appointment_id = test_appointment_id();
    let doctor = TestParticipant::doctor("Dr. Amina Diallo");
    let parent = TestParticipant::parent("Fatou Ndiaye");
    let doctor_uri = format!("/calls/{}/{}", appointment_id, doctor.id);
    let parent_uri = format!("/calls/{}/{}", appointment_id, parent.id);

    let (status, body) = send(
        &app,
        Method::POST,
        "/calls",
        Some(start_body(&appointment_id, &doctor)),
        Some("doctor-token"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["call"]["role"], "initiator");

    // the second start for the same participant is refused
    let (status, body) = send(
        &app,
        Method::POST,
        "/calls",
        Some(start_body(&appointment_id, &doctor)),
        Some("doctor-token"),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "conflict");

    // nobody on the other side yet
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("{}/chat", doctor_uri),
        Some(json!({ "text": "Bonjour" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &app,
        Method::POST,
        "/calls",
        Some(start_body(&appointment_id, &parent)),
        Some("parent-token"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["call"]["role"], "responder");

    for participant in [&doctor, &parent] {
        let controller = state
            .registry
            .get(&CallKey::new(appointment_id.clone(), participant.id.clone()))
            .await
            .unwrap();
        controller
            .lock()
            .await
            .wait_for_state(CallState::Connected, Duration::from_secs(2))
            .await
            .unwrap();
    }

    let (status, body) = send(&app, Method::GET, &doctor_uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["call"]["state"], "connected");

    let (status, body) = send(&app, Method::POST, &format!("{}/mute", doctor_uri), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["muted"], true);

    let (status, body) = send(&app, Method::POST, &format!("{}/camera", parent_uri), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["camera_off"], true);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("{}/chat", doctor_uri),
        Some(json!({ "text": "Comment va l'enfant ?" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let chat_log = body["call"]["chat_log"].as_array().unwrap();
    assert_eq!(chat_log.last().unwrap()["text"], "Comment va l'enfant ?");

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("{}/report", parent_uri),
        Some(json!({ "report": "Fever gone" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "forbidden");

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("{}/report", doctor_uri),
        Some(json!({ "report": "   " })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("{}/report", doctor_uri),
        Some(json!({ "report": "Fever gone, continue hydration" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["call"]["state"], "ended");

    let (status, body) = send(&app, Method::DELETE, &parent_uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["call"]["state"], "ended");

    // ended calls are released from the registry
    let (status, _) = send(&app, Method::GET, &parent_uri, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(state.registry.len().await, 1);

    let (_, body) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(body["active_calls"], 0);
}
