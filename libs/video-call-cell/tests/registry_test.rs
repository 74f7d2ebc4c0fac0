use std::sync::Arc;

use assert_matches::assert_matches;

use shared_utils::test_utils::{test_appointment_id, TestParticipant};
use video_call_cell::media::StaticMediaDevices;
use video_call_cell::models::{CallError, CallParams, CallRole, CallState};
use video_call_cell::services::registry::CallKey;
use video_call_cell::services::{
    CallDependencies, CallRegistry, InMemoryAppointmentStore, LoopbackNetwork, MemoryRelay,
};

fn deps(relay: &MemoryRelay) -> CallDependencies {
    CallDependencies {
        media: Arc::new(StaticMediaDevices::new()),
        relay: Arc::new(relay.clone()),
        engines: Arc::new(LoopbackNetwork::new()),
        appointments: Arc::new(InMemoryAppointmentStore::new()),
    }
}

fn doctor_params(appointment_id: &str) -> CallParams {
    let doctor = TestParticipant::doctor("Dr. Ngono");
    CallParams::new(appointment_id, doctor.id, CallRole::for_profile_role(&doctor.role))
        .with_display_name(doctor.full_name)
}

#[tokio::test]
async fn test_ended_calls_do_not_accumulate() {
    let registry = CallRegistry::with_independent_media();
    let relay = MemoryRelay::new();

    for _ in 0..5 {
        let params = doctor_params(&test_appointment_id());
        let key = CallKey::from(&params);
        registry.start(deps(&relay), params).await.unwrap();
        registry.end(&key).await.unwrap();
    }

    // the latest ended call stays readable until the next start
    assert_eq!(registry.len().await, 1);
    assert_eq!(registry.live_count().await, 0);
}

#[tokio::test]
async fn test_finish_releases_the_entry() {
    let registry = CallRegistry::with_independent_media();
    let relay = MemoryRelay::new();
    let params = doctor_params(&test_appointment_id());
    let key = CallKey::from(&params);

    registry.start(deps(&relay), params).await.unwrap();
    assert_eq!(registry.live_count().await, 1);

    let snapshot = registry.finish(&key).await.unwrap().unwrap();
    assert_eq!(snapshot.state, CallState::Ended);
    assert_eq!(registry.len().await, 0);
    assert_matches!(registry.get(&key).await, Err(CallError::SessionNotFound));
    assert_matches!(registry.finish(&key).await, Err(CallError::SessionNotFound));
}

#[tokio::test]
async fn test_failed_start_leaves_no_entry() {
    let registry = CallRegistry::with_independent_media();
    let relay = MemoryRelay::unavailable();
    let params = doctor_params(&test_appointment_id());
    let key = CallKey::from(&params);

    let result = registry.start(deps(&relay), params).await;

    assert_matches!(result, Err(CallError::RelayUnavailable { .. }));
    assert_eq!(registry.len().await, 0);
    assert_matches!(registry.get(&key).await, Err(CallError::SessionNotFound));
}

#[tokio::test]
async fn test_locked_ended_call_does_not_block_a_new_one() {
    let registry = CallRegistry::new();
    let relay = MemoryRelay::new();
    let first = doctor_params(&test_appointment_id());
    let first_key = CallKey::from(&first);

    let controller = registry.start(deps(&relay), first).await.unwrap();
    registry.end(&first_key).await.unwrap();

    // a reader such as a status request holds the ended call's lock
    let _reader = controller.lock().await;
    let second = registry
        .start(deps(&relay), doctor_params(&test_appointment_id()))
        .await;

    assert!(second.is_ok());
    assert_eq!(registry.live_count().await, 1);
}

#[tokio::test]
async fn test_live_call_blocks_a_new_one_while_locked() {
    let registry = CallRegistry::new();
    let relay = MemoryRelay::new();
    let first_appointment = test_appointment_id();
    let first = doctor_params(&first_appointment);
    let first_key = CallKey::from(&first);

    let controller = registry.start(deps(&relay), first).await.unwrap();

    {
        let _reader = controller.lock().await;
        let second = registry
            .start(deps(&relay), doctor_params(&test_appointment_id()))
            .await;
        assert_matches!(
            second,
            Err(CallError::SessionAlreadyActive { appointment_id }) if appointment_id == first_appointment
        );
    }

    assert_eq!(registry.len().await, 1);
    registry.end(&first_key).await.unwrap();
}
