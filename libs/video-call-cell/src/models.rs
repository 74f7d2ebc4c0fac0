// libs/video-call-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::media::RemoteStream;

// ==============================================================================
// CALL SESSION DOMAIN MODELS
// ==============================================================================

/// Side of the two-party negotiation this process plays.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Initiator,
    Responder,
}

impl CallRole {
    /// Doctors always open the negotiation; parents answer.
    pub fn for_profile_role(profile_role: &str) -> Self {
        if profile_role.trim().eq_ignore_ascii_case("doctor") {
            CallRole::Initiator
        } else {
            CallRole::Responder
        }
    }

    pub fn is_initiator(&self) -> bool {
        matches!(self, CallRole::Initiator)
    }

    /// The initiating doctor keeps the appointment record in sync.
    pub fn owns_appointment(&self) -> bool {
        self.is_initiator()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    AcquiringMedia,
    Signaling,
    Connecting,
    Connected,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// Transition table of the session state machine.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;

        match (*self, next) {
            (Ended | Failed, _) => false,
            (_, Ended) | (_, Failed) => true,
            (AcquiringMedia, Signaling) => true,
            (Signaling, Connecting) => true,
            (Connecting, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CallState::AcquiringMedia => "acquiring_media",
            CallState::Signaling => "signaling",
            CallState::Connecting => "connecting",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Lifecycle of the direct connection to the remote participant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Idle,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl PeerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Closed | PeerState::Failed)
    }

    pub fn can_transition_to(&self, next: PeerState) -> bool {
        use PeerState::*;

        match (*self, next) {
            (Closed | Failed, _) => false,
            (Idle, Negotiating) => true,
            (Negotiating, Connected) => true,
            (Negotiating | Connected, Failed) => true,
            (_, Closed) => true,
            _ => false,
        }
    }
}

// ==============================================================================
// SIGNALING MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    /// Recover the kind from a negotiation payload that does not carry one
    /// explicitly (`{type, sdp}` descriptions or `{candidate}` objects).
    pub fn infer(payload: &Value) -> Option<Self> {
        match payload.get("type").and_then(Value::as_str) {
            Some("offer") => Some(SignalKind::Offer),
            Some("answer") => Some(SignalKind::Answer),
            Some("candidate") => Some(SignalKind::Candidate),
            _ if payload.get("candidate").is_some() => Some(SignalKind::Candidate),
            _ => None,
        }
    }
}

/// Negotiation data exchanged over the relay. The payload is never inspected
/// by the relay; only the negotiation engine interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalingEnvelope {
    pub sender_id: String,
    pub kind: SignalKind,
    pub payload: Value,
}

impl SignalingEnvelope {
    pub fn new(sender_id: impl Into<String>, kind: SignalKind, payload: Value) -> Self {
        Self {
            sender_id: sender_id.into(),
            kind,
            payload,
        }
    }
}

// ==============================================================================
// CHAT MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatEntry {
    pub sender_label: String,
    pub text: String,
    pub direction: ChatDirection,
    pub at: DateTime<Utc>,
}

/// Chat message as it travels over the side channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatWireMessage {
    pub sender: String,
    pub text: String,
}

// ==============================================================================
// APPOINTMENT MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Ongoing,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Ongoing => "ongoing",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }
}

// ==============================================================================
// API REQUEST/RESPONSE MODELS
// ==============================================================================

/// Everything the caller knows about the consultation before the call starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallParams {
    pub appointment_id: String,
    pub local_participant_id: String,
    pub role: CallRole,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub counterpart_name: Option<String>,
}

impl CallParams {
    pub fn new(
        appointment_id: impl Into<String>,
        local_participant_id: impl Into<String>,
        role: CallRole,
    ) -> Self {
        Self {
            appointment_id: appointment_id.into(),
            local_participant_id: local_participant_id.into(),
            role,
            display_name: None,
            counterpart_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_counterpart_name(mut self, name: impl Into<String>) -> Self {
        self.counterpart_name = Some(name.into());
        self
    }

    /// Label attached to chat messages sent from this side.
    pub fn sender_label(&self) -> String {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.local_participant_id)
            .to_string()
    }

    /// Abbreviated appointment reference shown in the call header.
    pub fn short_appointment_id(&self) -> String {
        let short: String = self.appointment_id.chars().take(8).collect();
        if short.len() < self.appointment_id.len() {
            format!("{}...", short)
        } else {
            short
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
}

impl From<&CallError> for ErrorReport {
    fn from(err: &CallError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Render-ready view of one call session.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub appointment_id: String,
    pub appointment_ref: String,
    pub local_participant_id: String,
    pub role: CallRole,
    pub state: CallState,
    pub peer_state: PeerState,
    pub muted: bool,
    pub camera_off: bool,
    pub chat_log: Vec<ChatEntry>,
    pub remote_stream: Option<RemoteStream>,
    pub counterpart_name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorReport>,
}

impl CallSnapshot {
    pub fn new(params: &CallParams) -> Self {
        Self {
            appointment_id: params.appointment_id.clone(),
            appointment_ref: params.short_appointment_id(),
            local_participant_id: params.local_participant_id.clone(),
            role: params.role,
            state: CallState::AcquiringMedia,
            peer_state: PeerState::Idle,
            muted: false,
            camera_off: false,
            chat_log: Vec::new(),
            remote_stream: None,
            counterpart_name: params.counterpart_name.clone(),
            started_at: Utc::now(),
            ended_at: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartCallRequest {
    pub appointment_id: String,
    pub participant_id: String,
    /// Profile role of the local user (`doctor` or `parent`).
    pub profile_role: String,
    pub display_name: Option<String>,
    pub counterpart_name: Option<String>,
}

impl StartCallRequest {
    pub fn into_params(self) -> CallParams {
        CallParams {
            role: CallRole::for_profile_role(&self.profile_role),
            appointment_id: self.appointment_id,
            local_participant_id: self.participant_id,
            display_name: self.display_name,
            counterpart_name: self.counterpart_name,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatMessageRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ConsultationReportRequest {
    pub report: String,
}

// ==============================================================================
// ERROR HANDLING
// ==============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error("Camera or microphone unavailable: {message}")]
    MediaUnavailable { message: String },

    #[error("Signaling relay unavailable: {message}")]
    RelayUnavailable { message: String },

    #[error("Invalid signaling payload: {message}")]
    InvalidSignal { message: String },

    #[error("Data channel is not ready")]
    ChannelNotReady,

    #[error("No active media for this call")]
    NoActiveMedia,

    #[error("A call session is already active for appointment {appointment_id}")]
    SessionAlreadyActive { appointment_id: String },

    #[error("Peer connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Only the initiating participant can complete the appointment")]
    NotCallOwner,

    #[error("Call session not found")]
    SessionNotFound,

    #[error("Appointment store error: {message}")]
    AppointmentStore { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CallError {
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::MediaUnavailable { .. } => "media_unavailable",
            CallError::RelayUnavailable { .. } => "relay_unavailable",
            CallError::InvalidSignal { .. } => "invalid_signal",
            CallError::ChannelNotReady => "channel_not_ready",
            CallError::NoActiveMedia => "no_active_media",
            CallError::SessionAlreadyActive { .. } => "session_already_active",
            CallError::ConnectionFailed { .. } => "connection_failed",
            CallError::NotCallOwner => "not_call_owner",
            CallError::SessionNotFound => "session_not_found",
            CallError::AppointmentStore { .. } => "appointment_store",
            CallError::Internal { .. } => "internal",
        }
    }

    pub fn invalid_signal(message: impl Into<String>) -> Self {
        CallError::InvalidSignal {
            message: message.into(),
        }
    }

    pub fn relay_unavailable(message: impl Into<String>) -> Self {
        CallError::RelayUnavailable {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for CallError {
    fn from(err: anyhow::Error) -> Self {
        CallError::Internal {
            message: err.to_string(),
        }
    }
}
