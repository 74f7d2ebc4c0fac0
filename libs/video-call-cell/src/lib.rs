// libs/video-call-cell/src/lib.rs
//! # Video Call Cell
//!
//! Client-side core of a two-party consultation call: a doctor and a parent
//! joined by a direct media connection, negotiated over a relay channel
//! scoped to their appointment.
//!
//! ## Features
//!
//! - **Signaling Relay Client**: join `call:{appointment_id}`, broadcast
//!   negotiation envelopes, track presence
//! - **Peer Connection Manager**: offer/answer negotiation, remote media and
//!   an ordered chat channel
//! - **Call Session Controller**: one call lifecycle, mute/camera toggles,
//!   chat log and appointment completion
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------------+
//! |                  Video Call Cell                    |
//! +-----------------------------------------------------+
//! |  handlers.rs      |  HTTP endpoint handlers         |
//! |  router.rs        |  Route definitions              |
//! |  models.rs        |  Call states, envelopes, DTOs   |
//! |  media.rs         |  Local tracks and media leases  |
//! |  services/        |  Call machinery                 |
//! |    relay.rs       |  Signaling relay client         |
//! |    realtime.rs    |  Supabase Realtime transport    |
//! |    memory_relay.rs|  In-process relay hub           |
//! |    peer.rs        |  Peer connection manager        |
//! |    rtc.rs         |  webrtc-rs negotiation engine   |
//! |    loopback.rs    |  In-process negotiation engine  |
//! |    session.rs     |  Call session controller        |
//! |    appointments.rs|  Appointment status updates     |
//! |    registry.rs    |  Calls hosted by the agent      |
//! |    provider.rs    |  Per-call dependency wiring     |
//! +-----------------------------------------------------+
//! ```
//!
//! ## API Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /calls` - Start a call
//! - `GET /calls/{appointment_id}/{participant_id}` - Call snapshot
//! - `POST /calls/{appointment_id}/{participant_id}/mute` - Toggle microphone
//! - `POST /calls/{appointment_id}/{participant_id}/camera` - Toggle camera
//! - `POST /calls/{appointment_id}/{participant_id}/chat` - Send a chat message
//! - `POST /calls/{appointment_id}/{participant_id}/report` - Complete with report
//! - `DELETE /calls/{appointment_id}/{participant_id}` - End the call
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use video_call_cell::services::{
//!     CallDependencies, CallSessionController, InMemoryAppointmentStore, LoopbackNetwork,
//!     MemoryRelay,
//! };
//! use video_call_cell::media::StaticMediaDevices;
//! use video_call_cell::models::{CallParams, CallRole};
//!
//! # async fn example() -> Result<(), video_call_cell::CallError> {
//! let deps = CallDependencies {
//!     media: Arc::new(StaticMediaDevices::new()),
//!     relay: Arc::new(MemoryRelay::new()),
//!     engines: Arc::new(LoopbackNetwork::new()),
//!     appointments: Arc::new(InMemoryAppointmentStore::new()),
//! };
//!
//! let mut call = CallSessionController::new(deps);
//! call.start(CallParams::new("appointment-id", "doctor-id", CallRole::Initiator)).await?;
//! call.toggle_mute().await?;
//! call.end().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! - `SUPABASE_URL`, `SUPABASE_ANON_PUBLIC_KEY` - relay and appointment store
//! - `CALL_NEGOTIATION` - `webrtc` (default) or `loopback`
//! - `CALL_ICE_SERVERS` - comma separated STUN/TURN URLs

pub mod handlers;
pub mod media;
pub mod models;
pub mod router;
pub mod services;

// Re-export commonly used types
pub use models::{
    AppointmentStatus, CallError, CallParams, CallRole, CallSnapshot, CallState, ChatEntry,
    PeerState, SignalKind, SignalingEnvelope,
};

pub use services::{CallDependencies, CallRegistry, CallSessionController};

pub use router::video_call_routes;
