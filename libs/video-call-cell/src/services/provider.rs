// libs/video-call-cell/src/services/provider.rs
use std::sync::Arc;
use tracing::{info, warn};

use shared_config::{AppConfig, NegotiationMode};

use crate::media::{MediaDevices, StaticMediaDevices};
use crate::services::appointments::{
    AppointmentStatusStore, InMemoryAppointmentStore, SupabaseAppointmentStore,
};
use crate::services::loopback::LoopbackNetwork;
use crate::services::memory_relay::MemoryRelay;
use crate::services::realtime::SupabaseRealtimeTransport;
use crate::services::rtc::WebRtcEngineFactory;
use crate::services::session::CallDependencies;

/// Builds the collaborators of a new call for the caller holding `auth_token`.
pub trait DependencyProvider: Send + Sync {
    fn dependencies(&self, auth_token: Option<&str>) -> CallDependencies;
}

/// Wiring selected by the agent configuration.
///
/// `webrtc` calls go through Supabase Realtime and webrtc-rs. `loopback`
/// calls stay inside the process, which lets two participants of the same
/// agent talk to each other without any network.
pub struct ConfiguredDependencies {
    config: Arc<AppConfig>,
    media: Arc<dyn MediaDevices>,
    memory_relay: MemoryRelay,
    loopback: LoopbackNetwork,
    offline_store: Arc<InMemoryAppointmentStore>,
}

impl ConfiguredDependencies {
    pub fn new(config: Arc<AppConfig>, media: Arc<dyn MediaDevices>) -> Self {
        match config.negotiation_mode {
            NegotiationMode::WebRtc if !config.is_relay_configured() => {
                warn!("WebRTC negotiation selected but Supabase Realtime is not configured");
            }
            mode => info!("Call negotiation mode: {:?}", mode),
        }

        Self {
            config,
            media,
            memory_relay: MemoryRelay::new(),
            loopback: LoopbackNetwork::new(),
            offline_store: Arc::new(InMemoryAppointmentStore::new()),
        }
    }

    pub fn from_config(config: Arc<AppConfig>) -> Self {
        Self::new(config, Arc::new(StaticMediaDevices::new()))
    }

    fn appointments(&self, auth_token: Option<&str>) -> Arc<dyn AppointmentStatusStore> {
        if self.config.is_configured() {
            Arc::new(SupabaseAppointmentStore::new(
                &self.config,
                auth_token.map(str::to_string),
            ))
        } else {
            self.offline_store.clone()
        }
    }
}

impl DependencyProvider for ConfiguredDependencies {
    fn dependencies(&self, auth_token: Option<&str>) -> CallDependencies {
        let appointments = self.appointments(auth_token);

        match self.config.negotiation_mode {
            NegotiationMode::WebRtc => CallDependencies {
                media: self.media.clone(),
                relay: Arc::new(SupabaseRealtimeTransport::from_app_config(
                    &self.config,
                    auth_token.map(str::to_string),
                )),
                engines: Arc::new(WebRtcEngineFactory::from_app_config(&self.config)),
                appointments,
            },
            NegotiationMode::Loopback => CallDependencies {
                media: self.media.clone(),
                relay: Arc::new(self.memory_relay.clone()),
                engines: Arc::new(self.loopback.clone()),
                appointments,
            },
        }
    }
}
