// libs/video-call-cell/src/services/session.rs
use bytes::Bytes;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::media::{MediaConstraints, MediaDevices, MediaLease, RemoteStream, TrackKind};
use crate::models::{
    AppointmentStatus, CallError, CallParams, CallSnapshot, CallState, ChatDirection, ChatEntry,
    ChatWireMessage, ErrorReport, PeerState, SignalingEnvelope,
};
use crate::services::appointments::AppointmentStatusStore;
use crate::services::peer::{EngineFactory, PeerConfig, PeerConnectionManager, PeerEvent};
use crate::services::relay::{session_key, RelayNotice, RelayTransport, SignalingRelayClient};

const ERROR_CHANNEL_CAPACITY: usize = 32;

/// Collaborators a call session is built from.
#[derive(Clone)]
pub struct CallDependencies {
    pub media: Arc<dyn MediaDevices>,
    pub relay: Arc<dyn RelayTransport>,
    pub engines: Arc<dyn EngineFactory>,
    pub appointments: Arc<dyn AppointmentStatusStore>,
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// Read-only view of whether a controller's session driver is running.
/// Readable without holding the controller.
#[derive(Debug, Clone, Default)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, live: bool) {
        self.0.store(live, Ordering::Release);
    }
}

#[derive(Debug)]
enum SessionCommand {
    ToggleMute(Reply<bool>),
    ToggleCamera(Reply<bool>),
    SendChat { text: String, reply: Reply<()> },
    End { report: Option<String>, reply: Reply<()> },
}

struct ActiveCall {
    snapshot: watch::Receiver<CallSnapshot>,
    commands: Option<mpsc::UnboundedSender<SessionCommand>>,
    driver: Option<JoinHandle<()>>,
}

// ==============================================================================
// CONTROLLER
// ==============================================================================

/// Owns the lifecycle of one consultation call: local media, the relay
/// subscription and the peer connection. All session state lives in a driver
/// task; this handle talks to it through commands and observes it through
/// snapshots.
pub struct CallSessionController {
    deps: CallDependencies,
    errors: broadcast::Sender<CallError>,
    current: Option<ActiveCall>,
    liveness: Liveness,
}

impl std::fmt::Debug for CallSessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionController")
            .field("active", &self.current.is_some())
            .field("liveness", &self.liveness)
            .finish_non_exhaustive()
    }
}

impl CallSessionController {
    pub fn new(deps: CallDependencies) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            deps,
            errors,
            current: None,
            liveness: Liveness::default(),
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// Whether a session driver is running.
    pub fn is_live(&self) -> bool {
        self.current
            .as_ref()
            .and_then(|call| call.commands.as_ref())
            .is_some_and(|commands| !commands.is_closed())
    }

    /// Acquire media, join the relay scope and create the peer connection.
    /// On failure the session ends in FAILED with every acquired resource
    /// released.
    #[instrument(skip(self, params), fields(appointment_id = %params.appointment_id, participant = %params.local_participant_id))]
    pub async fn start(&mut self, params: CallParams) -> Result<(), CallError> {
        if self.is_live() {
            let appointment_id = self
                .current
                .as_ref()
                .map(|call| call.snapshot.borrow().appointment_id.clone())
                .unwrap_or_default();
            warn!("Refusing to start a second call while {} is active", appointment_id);
            return Err(CallError::SessionAlreadyActive { appointment_id });
        }

        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::new(&params));
        self.current = Some(ActiveCall {
            snapshot: snapshot_rx,
            commands: None,
            driver: None,
        });

        info!("Starting call as {:?}", params.role);
        let mut session = match self.establish(&params, snapshot_tx.clone()).await {
            Ok(session) => session,
            Err(err) => {
                error!("Call setup failed: {}", err);
                snapshot_tx.send_modify(|snapshot| {
                    snapshot.state = CallState::Failed;
                    snapshot.peer_state = PeerState::Closed;
                    snapshot.ended_at = Some(Utc::now());
                    snapshot.last_error = Some(ErrorReport::from(&err));
                });
                let _ = self.errors.send(err.clone());
                return Err(err);
            }
        };

        // recorded before the driver exists, so `completed` always lands last
        if params.role.owns_appointment() {
            if let Err(err) = self
                .deps
                .appointments
                .update_status(&params.appointment_id, AppointmentStatus::Ongoing, None)
                .await
            {
                warn!("Could not mark appointment {} ongoing: {}", params.appointment_id, err);
                session.report(err);
                session.publish();
            }
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        self.liveness.set(true);
        let driver = tokio::spawn(session.run(commands_rx, self.liveness.clone()));
        if let Some(call) = self.current.as_mut() {
            call.commands = Some(commands_tx);
            call.driver = Some(driver);
        }
        Ok(())
    }

    async fn establish(
        &self,
        params: &CallParams,
        snapshot: watch::Sender<CallSnapshot>,
    ) -> Result<CallSession, CallError> {
        let stream = self
            .deps
            .media
            .get_user_media(MediaConstraints::default())
            .await
            .map_err(|err| {
                warn!("Local media unavailable: {}", err);
                CallError::from(err)
            })?;
        // released on every early return below
        let media = MediaLease::new(stream.clone());
        debug!("Local stream {} acquired", stream.id());

        snapshot.send_modify(|s| s.state = CallState::Signaling);

        let mut relay = SignalingRelayClient::open(
            self.deps.relay.as_ref(),
            &session_key(&params.appointment_id),
            &params.local_participant_id,
        )
        .await?;

        let peer_config = PeerConfig::new(params.role.is_initiator(), stream);
        let peer = match PeerConnectionManager::create(self.deps.engines.as_ref(), peer_config).await {
            Ok(peer) => peer,
            Err(err) => {
                relay.close().await;
                return Err(err);
            }
        };

        let session = CallSession {
            sender_label: params.sender_label(),
            params: params.clone(),
            state: CallState::Signaling,
            media,
            relay,
            peer,
            appointments: self.deps.appointments.clone(),
            snapshot,
            errors: self.errors.clone(),
            muted: false,
            camera_off: false,
            chat_log: Vec::new(),
            remote_stream: None,
            remote_present: false,
            outbox: Vec::new(),
            last_error: None,
        };
        session.publish();
        Ok(session)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
        inactive: CallError,
    ) -> Result<T, CallError> {
        let Some(commands) = self.current.as_ref().and_then(|call| call.commands.as_ref()) else {
            return Err(inactive);
        };

        let (reply, response) = oneshot::channel();
        if commands.send(build(reply)).is_err() {
            return Err(inactive);
        }
        response.await.unwrap_or(Err(inactive))
    }

    /// Flip the local audio track. Returns the new muted flag.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(SessionCommand::ToggleMute, CallError::NoActiveMedia).await
    }

    /// Flip the local video track. Returns the new camera-off flag.
    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        self.request(SessionCommand::ToggleCamera, CallError::NoActiveMedia).await
    }

    /// Append `text` to the local chat log and send it to the remote peer.
    /// The local entry is kept even when delivery fails.
    pub async fn send_chat_message(&self, text: &str) -> Result<(), CallError> {
        let text = text.to_string();
        self.request(
            |reply| SessionCommand::SendChat { text, reply },
            CallError::ChannelNotReady,
        )
        .await
    }

    /// Tear the call down. Safe to call any number of times, in any state.
    pub async fn end(&mut self) -> Result<(), CallError> {
        self.finish(None).await
    }

    /// End the call and mark the appointment completed with the consultation
    /// report attached. Only the participant owning the appointment may do this.
    pub async fn complete_with_report(&mut self, report: &str) -> Result<(), CallError> {
        let Some(call) = self.current.as_ref() else {
            return Err(CallError::SessionNotFound);
        };
        if !call.snapshot.borrow().role.owns_appointment() {
            return Err(CallError::NotCallOwner);
        }
        if !self.is_live() {
            return Err(CallError::SessionNotFound);
        }

        self.finish(Some(report.to_string())).await
    }

    async fn finish(&mut self, report: Option<String>) -> Result<(), CallError> {
        let Some(call) = self.current.as_mut() else {
            return Ok(());
        };

        if let Some(commands) = call.commands.take() {
            let (reply, response) = oneshot::channel();
            if commands.send(SessionCommand::End { report, reply }).is_ok() {
                if let Ok(result) = response.await {
                    result?;
                }
            }
        }
        if let Some(driver) = call.driver.take() {
            if let Err(e) = driver.await {
                error!("Call driver terminated abnormally: {}", e);
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Option<CallSnapshot> {
        self.current.as_ref().map(|call| call.snapshot.borrow().clone())
    }

    pub fn subscribe(&self) -> Option<watch::Receiver<CallSnapshot>> {
        self.current.as_ref().map(|call| call.snapshot.clone())
    }

    /// Every error the controller reports, fatal or recoverable.
    pub fn errors(&self) -> broadcast::Receiver<CallError> {
        self.errors.subscribe()
    }

    /// Wait until the session snapshot satisfies `predicate`.
    pub async fn wait_until(
        &self,
        within: Duration,
        predicate: impl FnMut(&CallSnapshot) -> bool,
    ) -> Result<CallSnapshot, CallError> {
        let mut updates = self.subscribe().ok_or(CallError::SessionNotFound)?;
        let outcome = match tokio::time::timeout(within, updates.wait_for(predicate)).await {
            Ok(Ok(snapshot)) => Ok(snapshot.clone()),
            Ok(Err(_)) => Err(CallError::Internal {
                message: "call session stopped before reaching the expected state".to_string(),
            }),
            Err(_) => Err(CallError::Internal {
                message: format!("call state not reached within {:?}", within),
            }),
        };
        outcome
    }

    pub async fn wait_for_state(&self, target: CallState, within: Duration) -> Result<CallSnapshot, CallError> {
        let snapshot = self
            .wait_until(within, |s| s.state == target || s.state.is_terminal())
            .await?;
        if snapshot.state == target {
            Ok(snapshot)
        } else {
            Err(CallError::Internal {
                message: format!("call reached {} while waiting for {}", snapshot.state, target),
            })
        }
    }
}

// ==============================================================================
// SESSION DRIVER
// ==============================================================================

struct CallSession {
    params: CallParams,
    sender_label: String,
    state: CallState,
    media: MediaLease,
    relay: SignalingRelayClient,
    peer: PeerConnectionManager,
    appointments: Arc<dyn AppointmentStatusStore>,
    snapshot: watch::Sender<CallSnapshot>,
    errors: broadcast::Sender<CallError>,
    muted: bool,
    camera_off: bool,
    chat_log: Vec<ChatEntry>,
    remote_stream: Option<RemoteStream>,
    remote_present: bool,
    /// Local negotiation data held until the remote participant is present.
    outbox: Vec<SignalingEnvelope>,
    last_error: Option<CallError>,
}

impl CallSession {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>, liveness: Liveness) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("Controller dropped, ending call");
                        self.teardown(CallState::Ended, None).await;
                    }
                },
                notice = self.relay.next_event() => {
                    if let Some(notice) = notice {
                        self.on_relay_notice(notice).await;
                    }
                }
                event = self.peer.next_event() => {
                    if let Some(event) = event {
                        self.on_peer_event(event).await;
                    }
                }
            }

            if self.state.is_terminal() {
                break;
            }
        }

        liveness.set(false);

        // late commands still get an answer
        commands.close();
        while let Ok(command) = commands.try_recv() {
            self.handle_command(command).await;
        }
        debug!("Call driver for {} stopped", self.params.appointment_id);
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::ToggleMute(reply) => {
                let _ = reply.send(self.toggle(TrackKind::Audio));
            }
            SessionCommand::ToggleCamera(reply) => {
                let _ = reply.send(self.toggle(TrackKind::Video));
            }
            SessionCommand::SendChat { text, reply } => {
                let result = self.send_chat(text).await;
                let _ = reply.send(result);
            }
            SessionCommand::End { report, reply } => {
                self.teardown(CallState::Ended, report).await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn toggle(&mut self, kind: TrackKind) -> Result<bool, CallError> {
        let track = self
            .media
            .stream()
            .and_then(|stream| match kind {
                TrackKind::Audio => stream.audio_track(),
                TrackKind::Video => stream.video_track(),
            })
            .filter(|track| !track.is_stopped())
            .cloned()
            .ok_or(CallError::NoActiveMedia)?;

        let flag = match kind {
            TrackKind::Audio => {
                self.muted = !self.muted;
                self.muted
            }
            TrackKind::Video => {
                self.camera_off = !self.camera_off;
                self.camera_off
            }
        };
        track.set_enabled(!flag);
        debug!("{:?} track {}", kind, if flag { "disabled" } else { "enabled" });

        self.publish();
        Ok(flag)
    }

    async fn send_chat(&mut self, text: String) -> Result<(), CallError> {
        if text.trim().is_empty() {
            debug!("Ignoring empty chat message");
            return Ok(());
        }
        if self.state.is_terminal() {
            return Err(CallError::ChannelNotReady);
        }

        self.chat_log.push(ChatEntry {
            sender_label: self.sender_label.clone(),
            text: text.clone(),
            direction: ChatDirection::Outgoing,
            at: Utc::now(),
        });
        self.publish();

        if self.state != CallState::Connected {
            return Err(CallError::ChannelNotReady);
        }

        let wire = ChatWireMessage {
            sender: self.sender_label.clone(),
            text,
        };
        let payload = serde_json::to_vec(&wire).map_err(|e| CallError::Internal {
            message: format!("failed to encode chat message: {}", e),
        })?;

        self.peer.send_data(Bytes::from(payload)).await.map_err(|err| {
            warn!("Chat message kept locally but not delivered: {}", err);
            err
        })
    }

    async fn on_relay_notice(&mut self, notice: RelayNotice) {
        match notice {
            RelayNotice::Signal(envelope) => {
                debug!("Applying {:?} from {}", envelope.kind, envelope.sender_id);
                match self.peer.apply_remote_signal(&envelope).await {
                    Ok(()) => {
                        self.advance(CallState::Connecting);
                    }
                    Err(err) if self.peer.state() == PeerState::Failed => {
                        self.fail(CallError::ConnectionFailed {
                            message: err.to_string(),
                        })
                        .await;
                    }
                    Err(err) => {
                        warn!("Ignoring unusable signal: {}", err);
                        self.report(err);
                        self.publish();
                    }
                }
            }
            RelayNotice::Presence { participant_id } => {
                if participant_id == self.params.local_participant_id {
                    debug!("Relay subscription live");
                    return;
                }
                if !self.remote_present {
                    info!("Remote participant {} present", participant_id);
                    self.remote_present = true;
                }
                self.flush_outbox().await;
            }
            RelayNotice::Invalid(err) => {
                warn!("Undecodable signal on the relay: {}", err);
                self.report(err);
                self.publish();
            }
            RelayNotice::PresenceLeft { participant_id } => {
                info!("Remote participant {} left the relay", participant_id);
            }
            RelayNotice::Lost { reason } => {
                if self.state == CallState::Connected {
                    warn!("Relay lost during an established call: {}", reason);
                    return;
                }
                self.fail(CallError::relay_unavailable(reason)).await;
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalSignal { kind, payload } => {
                self.outbox.push(SignalingEnvelope::new(
                    self.params.local_participant_id.clone(),
                    kind,
                    payload,
                ));
                if self.remote_present {
                    self.flush_outbox().await;
                } else {
                    debug!("Holding {:?} until the remote participant joins", kind);
                }
            }
            PeerEvent::RemoteStream(stream) => {
                info!("Remote media available ({:?})", stream.kinds);
                self.remote_stream = Some(stream);
                self.publish();
            }
            PeerEvent::Connected => {
                self.advance(CallState::Connecting);
                if self.advance(CallState::Connected) {
                    info!("Call connected");
                }
            }
            PeerEvent::Data(data) => match serde_json::from_slice::<ChatWireMessage>(&data) {
                Ok(message) => {
                    self.chat_log.push(ChatEntry {
                        sender_label: message.sender,
                        text: message.text,
                        direction: ChatDirection::Incoming,
                        at: Utc::now(),
                    });
                    self.publish();
                }
                Err(e) => warn!("Discarding malformed chat payload: {}", e),
            },
            PeerEvent::Closed => {
                info!("Remote participant closed the connection");
                self.teardown(CallState::Ended, None).await;
            }
            PeerEvent::Failed(reason) => {
                self.fail(CallError::ConnectionFailed { message: reason }).await;
            }
        }
    }

    async fn flush_outbox(&mut self) {
        for envelope in std::mem::take(&mut self.outbox) {
            if let Err(err) = self.relay.send(&envelope).await {
                self.fail(err).await;
                return;
            }
            self.advance(CallState::Connecting);
        }
    }

    fn advance(&mut self, next: CallState) -> bool {
        if self.state == next || !self.state.can_transition_to(next) {
            return false;
        }
        info!("Call state {} -> {}", self.state, next);
        self.state = next;
        self.publish();
        true
    }

    fn report(&mut self, err: CallError) {
        let _ = self.errors.send(err.clone());
        self.last_error = Some(err);
    }

    async fn fail(&mut self, err: CallError) {
        if self.state.is_terminal() {
            return;
        }
        error!("Call failed: {}", err);
        self.report(err);
        self.teardown(CallState::Failed, None).await;
    }

    /// Release media, the peer connection and the relay subscription, then
    /// settle in `outcome`. Completion is recorded only for calls that ended
    /// normally and only by the participant owning the appointment.
    async fn teardown(&mut self, outcome: CallState, report: Option<String>) {
        if self.state.is_terminal() {
            return;
        }

        self.media.release();
        self.peer.destroy().await;
        self.relay.close().await;
        self.remote_stream = None;
        self.outbox.clear();

        info!("Call state {} -> {}", self.state, outcome);
        self.state = outcome;

        if outcome == CallState::Ended && self.params.role.owns_appointment() {
            if let Err(err) = self
                .appointments
                .update_status(
                    &self.params.appointment_id,
                    AppointmentStatus::Completed,
                    report.as_deref(),
                )
                .await
            {
                warn!("Appointment {} not marked completed: {}", self.params.appointment_id, err);
                self.report(err);
            }
        }

        self.publish();
    }

    fn publish(&self) {
        let ended_at = self.state.is_terminal().then(Utc::now);
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = self.state;
            snapshot.peer_state = self.peer.state();
            snapshot.muted = self.muted;
            snapshot.camera_off = self.camera_off;
            snapshot.chat_log = self.chat_log.clone();
            snapshot.remote_stream = self.remote_stream.clone();
            snapshot.last_error = self.last_error.as_ref().map(ErrorReport::from);
            if snapshot.ended_at.is_none() {
                snapshot.ended_at = ended_at;
            }
        });
    }
}
