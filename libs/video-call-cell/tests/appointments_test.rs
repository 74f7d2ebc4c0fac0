use assert_matches::assert_matches;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shared_utils::test_utils::{test_appointment_id, TestConfig};
use video_call_cell::models::{AppointmentStatus, CallError};
use video_call_cell::services::appointments::AppointmentStatusStore;
use video_call_cell::services::SupabaseAppointmentStore;

async fn store_for(server: &MockServer) -> SupabaseAppointmentStore {
    let config = TestConfig::with_supabase_url(server.uri()).to_app_config();
    SupabaseAppointmentStore::new(&config, Some("doctor-token".to_string()))
}

#[tokio::test]
async fn test_completion_sends_status_and_notes() {
    let mock_server = MockServer::start().await;
    let appointment_id = test_appointment_id();

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("id", format!("eq.{}", appointment_id)))
        .and(header("authorization", "Bearer doctor-token"))
        .and(header("Prefer", "return=representation"))
        .and(body_json(json!({
            "status": "completed",
            "notes": "Fever gone, continue hydration"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": appointment_id,
            "status": "completed"
        }])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server).await;
    store
        .update_status(
            &appointment_id,
            AppointmentStatus::Completed,
            Some("Fever gone, continue hydration"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_ongoing_update_has_no_notes() {
    let mock_server = MockServer::start().await;
    let appointment_id = test_appointment_id();

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .and(body_json(json!({ "status": "ongoing" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": appointment_id }])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server).await;
    store
        .update_status(&appointment_id, AppointmentStatus::Ongoing, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_no_matching_row_is_an_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server).await;
    let result = store
        .update_status("unknown", AppointmentStatus::Completed, None)
        .await;

    assert_matches!(result, Err(CallError::AppointmentStore { message }) if message.contains("unknown"));
}

#[tokio::test]
async fn test_rejected_token_is_an_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(401).set_body_string("JWT expired"))
        .mount(&mock_server)
        .await;

    let store = store_for(&mock_server).await;
    let err = store
        .update_status(&test_appointment_id(), AppointmentStatus::Ongoing, None)
        .await
        .unwrap_err();

    assert_matches!(err, CallError::AppointmentStore { .. });
    assert!(err.to_string().contains("Authentication error"));
}
