// libs/video-call-cell/src/media.rs
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::models::CallError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug)]
struct TrackFlags {
    enabled: AtomicBool,
    stopped: AtomicBool,
}

/// Handle to one captured track. Clones share the same enabled/stopped flags,
/// so the capture pipeline and the negotiation engine observe every toggle.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    flags: Arc<TrackFlags>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            flags: Arc::new(TrackFlags {
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.flags.enabled.load(Ordering::SeqCst)
    }

    /// Ignored once the track has been stopped.
    pub fn set_enabled(&self, enabled: bool) {
        if !self.is_stopped() {
            self.flags.enabled.store(enabled, Ordering::SeqCst);
        }
    }

    pub fn stop(&self) {
        self.flags.stopped.store(true, Ordering::SeqCst);
        self.flags.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Tracks still holding the device.
    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| !t.is_stopped()).count()
    }
}

/// Media received from the remote participant. Referenced, never owned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteStream {
    pub id: String,
    pub kinds: Vec<TrackKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MediaError {
    #[error("permission to use camera and microphone was denied")]
    PermissionDenied,

    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        CallError::MediaUnavailable {
            message: err.to_string(),
        }
    }
}

/// Platform capture primitive (the `getUserMedia` of this crate).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError>;
}

/// Capture source that hands out software tracks. Used where device capture
/// happens outside this process and by tests, which can inspect every stream
/// it issued.
#[derive(Default)]
pub struct StaticMediaDevices {
    failure: Option<MediaError>,
    issued: Mutex<Vec<MediaStream>>,
}

impl StaticMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denied() -> Self {
        Self {
            failure: Some(MediaError::PermissionDenied),
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable(reason: &str) -> Self {
        Self {
            failure: Some(MediaError::DeviceUnavailable(reason.to_string())),
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn issued_streams(&self) -> Vec<MediaStream> {
        self.issued
            .lock()
            .map(|issued| issued.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MediaDevices for StaticMediaDevices {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(TrackKind::Video));
        }
        if tracks.is_empty() {
            return Err(MediaError::DeviceUnavailable("no track requested".to_string()));
        }

        let stream = MediaStream::new(tracks);
        if let Ok(mut issued) = self.issued.lock() {
            issued.push(stream.clone());
        }
        Ok(stream)
    }
}

/// Exclusive ownership of the local stream. Every track is stopped when the
/// lease is released or dropped, whichever comes first.
#[derive(Debug)]
pub struct MediaLease {
    stream: Option<MediaStream>,
}

impl MediaLease {
    pub fn new(stream: MediaStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!("Releasing local stream {}", stream.id());
            stream.stop_all();
        }
    }

    pub fn is_released(&self) -> bool {
        self.stream.is_none()
    }
}

impl Drop for MediaLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_devices_issue_requested_tracks() {
        let devices = StaticMediaDevices::new();
        let stream = devices
            .get_user_media(MediaConstraints { audio: true, video: false })
            .await
            .unwrap();

        assert_eq!(stream.tracks().len(), 1);
        assert!(stream.audio_track().is_some());
        assert!(stream.video_track().is_none());
        assert_eq!(devices.issued_streams().len(), 1);
    }

    #[tokio::test]
    async fn test_denied_devices_map_to_media_unavailable() {
        let devices = StaticMediaDevices::denied();
        let err = devices.get_user_media(MediaConstraints::default()).await.unwrap_err();
        assert_eq!(err, MediaError::PermissionDenied);
        assert_eq!(CallError::from(err).kind(), "media_unavailable");
    }

    #[test]
    fn test_stopped_track_cannot_be_reenabled() {
        let track = MediaTrack::new(TrackKind::Video);
        track.stop();
        track.set_enabled(true);
        assert!(!track.is_enabled());
        assert!(track.is_stopped());
    }

    #[test]
    fn test_lease_stops_tracks_on_drop() {
        let stream = MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio),
            MediaTrack::new(TrackKind::Video),
        ]);
        let observer = stream.clone();
        {
            let _lease = MediaLease::new(stream);
            assert_eq!(observer.live_track_count(), 2);
        }
        assert_eq!(observer.live_track_count(), 0);
    }
}
