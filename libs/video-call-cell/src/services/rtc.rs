// libs/video-call-cell/src/services/rtc.rs
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use shared_config::AppConfig;

use super::peer::{EngineEvent, EngineFactory, EngineFault, NegotiationEngine, PeerConfig};
use crate::media::{MediaStream, RemoteStream, TrackKind};
use crate::models::{CallError, SignalKind};

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

/// Engines backed by webrtc-rs. Negotiation is non-trickle: descriptions are
/// sent once ICE gathering completed, so they already carry every candidate.
/// Remote candidate messages are still accepted.
#[derive(Debug, Clone)]
pub struct WebRtcEngineFactory {
    ice_servers: Vec<String>,
}

impl WebRtcEngineFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }
}

async fn build_peer_connection(ice_servers: &[String]) -> Result<RTCPeerConnection, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let ice_servers = if ice_servers.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls: ice_servers.to_vec(),
            ..Default::default()
        }]
    };

    api.new_peer_connection(RTCConfiguration {
        ice_servers,
        ..Default::default()
    })
    .await
}

async fn attach_local_tracks(pc: &RTCPeerConnection, stream: &MediaStream) -> Result<(), webrtc::Error> {
    for track in stream.tracks() {
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                ..Default::default()
            },
            track.id().to_string(),
            stream.id().to_string(),
        ));

        let sender = pc.add_track(local).await?;
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
    }
    Ok(())
}

fn wire_data_channel(channel: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<EngineEvent>) {
    let label = channel.label().to_string();

    let open_events = events.clone();
    channel.on_open(Box::new(move || {
        let events = open_events.clone();
        let label = label.clone();
        Box::pin(async move {
            info!("Data channel '{}' open", label);
            let _ = events.send(EngineEvent::ChannelOpen);
        })
    }));

    let message_events = events.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = message_events.send(EngineEvent::Data(msg.data));
        Box::pin(async {})
    }));

    let close_events = events.clone();
    channel.on_close(Box::new(move || {
        let _ = close_events.send(EngineEvent::Closed);
        Box::pin(async {})
    }));
}

/// Produce the complete local description of `kind` once ICE gathering is done.
async fn local_description(pc: &RTCPeerConnection, kind: SignalKind) -> Result<Value, String> {
    let description = match kind {
        SignalKind::Offer => pc.create_offer(None).await,
        _ => pc.create_answer(None).await,
    }
    .map_err(|e| format!("failed to create {:?}: {}", kind, e))?;

    let mut gathering = pc.gathering_complete_promise().await;
    pc.set_local_description(description)
        .await
        .map_err(|e| format!("failed to set local description: {}", e))?;
    let _ = gathering.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| "local description missing after gathering".to_string())?;
    serde_json::to_value(&local).map_err(|e| format!("failed to encode description: {}", e))
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        config: PeerConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Box<dyn NegotiationEngine>, CallError> {
        let connection_failed = |stage: &str, e: webrtc::Error| {
            error!("WebRTC {} failed: {}", stage, e);
            CallError::ConnectionFailed {
                message: format!("{}: {}", stage, e),
            }
        };

        let pc = Arc::new(
            build_peer_connection(&self.ice_servers)
                .await
                .map_err(|e| connection_failed("peer connection setup", e))?,
        );

        attach_local_tracks(&pc, &config.local_stream)
            .await
            .map_err(|e| connection_failed("local track setup", e))?;

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("Peer connection state: {}", state);
            match state {
                RTCPeerConnectionState::Failed => {
                    let _ = state_events.send(EngineEvent::Error("ICE connection failed".to_string()));
                }
                RTCPeerConnectionState::Closed => {
                    let _ = state_events.send(EngineEvent::Closed);
                }
                _ => {}
            }
            Box::pin(async {})
        }));

        let remote_stream_id = Uuid::new_v4().to_string();
        let track_events = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let _ = track_events.send(EngineEvent::RemoteStream(RemoteStream {
                        id: remote_stream_id.clone(),
                        kinds: vec![kind],
                    }));
                }
                Box::pin(async {})
            },
        ));

        let channel: ChannelSlot = Arc::new(Mutex::new(None));
        if config.is_initiator {
            let dc = pc
                .create_data_channel(
                    &config.channel_label,
                    Some(RTCDataChannelInit {
                        ordered: Some(true),
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| connection_failed("data channel setup", e))?;
            wire_data_channel(&dc, &events);
            *channel.lock().await = Some(dc);
        } else {
            let slot = channel.clone();
            let channel_events = events.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let slot = slot.clone();
                let events = channel_events.clone();
                Box::pin(async move {
                    debug!("Remote data channel '{}' announced", dc.label());
                    wire_data_channel(&dc, &events);
                    *slot.lock().await = Some(dc);
                })
            }));
        }

        Ok(Box::new(WebRtcEngine {
            pc,
            is_initiator: config.is_initiator,
            events,
            channel,
            pending_candidates: Vec::new(),
            remote_description_set: false,
            tasks: Vec::new(),
            closed: false,
        }))
    }
}

struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    is_initiator: bool,
    events: mpsc::UnboundedSender<EngineEvent>,
    channel: ChannelSlot,
    pending_candidates: Vec<RTCIceCandidateInit>,
    remote_description_set: bool,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl WebRtcEngine {
    fn spawn_description(&mut self, kind: SignalKind) {
        let pc = self.pc.clone();
        let events = self.events.clone();
        self.tasks.push(tokio::spawn(async move {
            match local_description(&pc, kind).await {
                Ok(payload) => {
                    let _ = events.send(EngineEvent::Signal { kind, payload });
                }
                Err(reason) => {
                    warn!("Negotiation failed: {}", reason);
                    let _ = events.send(EngineEvent::Error(reason));
                }
            }
        }));
    }

    fn ensure_usable(&self) -> Result<(), EngineFault> {
        if self.closed {
            return Err(EngineFault::Fatal("engine destroyed".to_string()));
        }
        match self.pc.connection_state() {
            RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed => Err(EngineFault::Fatal(
                "peer connection is no longer usable".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl NegotiationEngine for WebRtcEngine {
    async fn start(&mut self) -> Result<(), EngineFault> {
        self.ensure_usable()?;
        if self.is_initiator {
            self.spawn_description(SignalKind::Offer);
        }
        Ok(())
    }

    async fn apply_signal(&mut self, kind: SignalKind, payload: Value) -> Result<(), EngineFault> {
        self.ensure_usable()?;

        match kind {
            SignalKind::Offer | SignalKind::Answer => {
                let description: RTCSessionDescription = serde_json::from_value(payload)
                    .map_err(|e| EngineFault::Malformed(format!("invalid session description: {}", e)))?;

                let expected = if kind == SignalKind::Offer {
                    RTCSdpType::Offer
                } else {
                    RTCSdpType::Answer
                };
                if description.sdp_type != expected {
                    return Err(EngineFault::Malformed(format!(
                        "description type {} does not match {:?}",
                        description.sdp_type, kind
                    )));
                }
                if (kind == SignalKind::Offer) == self.is_initiator {
                    return Err(EngineFault::Malformed(format!(
                        "unexpected {:?} for this side of the call",
                        kind
                    )));
                }

                self.pc
                    .set_remote_description(description)
                    .await
                    .map_err(|e| EngineFault::Malformed(format!("remote description rejected: {}", e)))?;
                self.remote_description_set = true;

                for candidate in std::mem::take(&mut self.pending_candidates) {
                    if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                        warn!("Dropping buffered ICE candidate: {}", e);
                    }
                }

                if kind == SignalKind::Offer {
                    self.spawn_description(SignalKind::Answer);
                }
                Ok(())
            }
            SignalKind::Candidate => {
                let init_value = match payload.get("candidate") {
                    Some(inner) if inner.is_object() => inner.clone(),
                    _ => payload,
                };
                let candidate: RTCIceCandidateInit = serde_json::from_value(init_value)
                    .map_err(|e| EngineFault::Malformed(format!("invalid ICE candidate: {}", e)))?;

                if !self.remote_description_set {
                    self.pending_candidates.push(candidate);
                    return Ok(());
                }
                self.pc
                    .add_ice_candidate(candidate)
                    .await
                    .map_err(|e| EngineFault::Malformed(format!("ICE candidate rejected: {}", e)))
            }
        }
    }

    async fn send_data(&self, data: Bytes) -> Result<(), String> {
        let channel = self.channel.lock().await.clone();
        match channel {
            Some(dc) => dc.send(&data).await.map(|_| ()).map_err(|e| e.to_string()),
            None => Err("data channel not negotiated yet".to_string()),
        }
    }

    async fn destroy(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection: {}", e);
        }
        self.channel.lock().await.take();
        debug!("WebRTC engine destroyed");
    }
}
