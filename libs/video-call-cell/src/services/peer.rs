// libs/video-call-cell/src/services/peer.rs
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::media::{MediaStream, RemoteStream};
use crate::models::{CallError, PeerState, SignalKind, SignalingEnvelope};

/// Label of the reliable, ordered side channel carrying chat.
pub const CHAT_CHANNEL_LABEL: &str = "chat";

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub is_initiator: bool,
    pub local_stream: MediaStream,
    pub channel_label: String,
}

impl PeerConfig {
    pub fn new(is_initiator: bool, local_stream: MediaStream) -> Self {
        Self {
            is_initiator,
            local_stream,
            channel_label: CHAT_CHANNEL_LABEL.to_string(),
        }
    }
}

/// Callbacks of a negotiation engine, delivered in order.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Negotiation data to forward to the remote peer.
    Signal { kind: SignalKind, payload: Value },
    RemoteStream(RemoteStream),
    ChannelOpen,
    Data(Bytes),
    Closed,
    Error(String),
}

/// Why applying remote negotiation data failed.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineFault {
    /// The payload was rejected; the engine is still usable.
    Malformed(String),
    /// The engine cannot continue.
    Fatal(String),
}

/// The offer/answer negotiation machinery behind a peer connection.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    /// Called once after creation. Initiators produce their offer from here.
    async fn start(&mut self) -> Result<(), EngineFault>;

    async fn apply_signal(&mut self, kind: SignalKind, payload: Value) -> Result<(), EngineFault>;

    async fn send_data(&self, data: Bytes) -> Result<(), String>;

    /// Idempotent.
    async fn destroy(&mut self);
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        config: PeerConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Box<dyn NegotiationEngine>, CallError>;
}

/// What a call session observes from its peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalSignal { kind: SignalKind, payload: Value },
    RemoteStream(RemoteStream),
    Connected,
    Data(Bytes),
    Closed,
    Failed(String),
}

pub struct PeerConnectionManager {
    state: PeerState,
    engine: Box<dyn NegotiationEngine>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    pending: VecDeque<PeerEvent>,
    remote_stream: Option<RemoteStream>,
    channel_open: bool,
    destroyed: bool,
}

impl PeerConnectionManager {
    pub async fn create(factory: &dyn EngineFactory, config: PeerConfig) -> Result<Self, CallError> {
        let is_initiator = config.is_initiator;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = factory.create(config, events_tx).await?;

        let mut manager = Self {
            state: PeerState::Idle,
            engine,
            events: events_rx,
            pending: VecDeque::new(),
            remote_stream: None,
            channel_open: false,
            destroyed: false,
        };

        if is_initiator {
            manager.transition(PeerState::Negotiating);
        }

        if let Err(fault) = manager.engine.start().await {
            manager.destroy().await;
            let message = match fault {
                EngineFault::Malformed(reason) | EngineFault::Fatal(reason) => reason,
            };
            return Err(CallError::ConnectionFailed { message });
        }

        debug!(
            "Peer connection created as {}",
            if is_initiator { "initiator" } else { "responder" }
        );
        Ok(manager)
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn is_channel_ready(&self) -> bool {
        self.state == PeerState::Connected && self.channel_open
    }

    fn transition(&mut self, next: PeerState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            debug!("Ignoring peer transition {:?} -> {:?}", self.state, next);
            return false;
        }
        debug!("Peer state {:?} -> {:?}", self.state, next);
        self.state = next;
        true
    }

    /// Feed negotiation data received from the remote participant.
    pub async fn apply_remote_signal(&mut self, envelope: &SignalingEnvelope) -> Result<(), CallError> {
        if self.state.is_terminal() {
            return Err(CallError::invalid_signal("peer connection is closed"));
        }
        if self.state == PeerState::Idle {
            self.transition(PeerState::Negotiating);
        }

        match self
            .engine
            .apply_signal(envelope.kind, envelope.payload.clone())
            .await
        {
            Ok(()) => Ok(()),
            Err(EngineFault::Malformed(reason)) => {
                warn!("Rejected {:?} signal from {}: {}", envelope.kind, envelope.sender_id, reason);
                Err(CallError::invalid_signal(reason))
            }
            Err(EngineFault::Fatal(reason)) => {
                warn!("Negotiation aborted by {:?} signal: {}", envelope.kind, reason);
                self.transition(PeerState::Failed);
                self.release_engine().await;
                Err(CallError::invalid_signal(reason))
            }
        }
    }

    pub async fn send_data(&self, data: Bytes) -> Result<(), CallError> {
        if !self.is_channel_ready() {
            return Err(CallError::ChannelNotReady);
        }

        self.engine.send_data(data).await.map_err(|reason| {
            warn!("Data channel send failed: {}", reason);
            CallError::ChannelNotReady
        })
    }

    /// Next peer event. Never resolves once the connection is closed or failed.
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.state.is_terminal() {
                return std::future::pending().await;
            }

            let event = self.events.recv().await.unwrap_or(EngineEvent::Closed);
            match event {
                EngineEvent::Signal { kind, payload } => {
                    if self.state == PeerState::Idle {
                        self.transition(PeerState::Negotiating);
                    }
                    return Some(PeerEvent::LocalSignal { kind, payload });
                }
                EngineEvent::RemoteStream(stream) => {
                    match self.remote_stream.as_mut() {
                        Some(existing) => {
                            for kind in stream.kinds {
                                if !existing.kinds.contains(&kind) {
                                    existing.kinds.push(kind);
                                }
                            }
                            self.pending.push_back(PeerEvent::RemoteStream(existing.clone()));
                        }
                        None => {
                            info!("Remote stream {} received", stream.id);
                            self.remote_stream = Some(stream.clone());
                            self.pending.push_back(PeerEvent::RemoteStream(stream));
                        }
                    }
                    self.mark_connected();
                }
                EngineEvent::ChannelOpen => {
                    self.channel_open = true;
                    self.mark_connected();
                }
                EngineEvent::Data(data) => {
                    if self.channel_open {
                        return Some(PeerEvent::Data(data));
                    }
                    debug!("Dropping {} bytes received before the channel opened", data.len());
                }
                EngineEvent::Closed => {
                    self.transition(PeerState::Closed);
                    self.remote_stream = None;
                    self.channel_open = false;
                    return Some(PeerEvent::Closed);
                }
                EngineEvent::Error(reason) => {
                    if self.state == PeerState::Idle {
                        self.transition(PeerState::Negotiating);
                    }
                    self.transition(PeerState::Failed);
                    self.channel_open = false;
                    return Some(PeerEvent::Failed(reason));
                }
            }
        }
    }

    fn mark_connected(&mut self) {
        if self.state == PeerState::Idle {
            self.transition(PeerState::Negotiating);
        }
        if self.transition(PeerState::Connected) {
            info!("Peer connection established");
            self.pending.push_back(PeerEvent::Connected);
        }
    }

    async fn release_engine(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.engine.destroy().await;
        self.events.close();
    }

    /// Release the engine and every transport resource. Idempotent.
    pub async fn destroy(&mut self) {
        self.release_engine().await;
        self.transition(PeerState::Closed);
        self.remote_stream = None;
        self.channel_open = false;
        self.pending.clear();
    }
}
