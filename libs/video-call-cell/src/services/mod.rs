// libs/video-call-cell/src/services/mod.rs

pub mod appointments;
pub mod loopback;
pub mod memory_relay;
pub mod peer;
pub mod provider;
pub mod realtime;
pub mod registry;
pub mod relay;
pub mod rtc;
pub mod session;

pub use appointments::{AppointmentStatusStore, InMemoryAppointmentStore, SupabaseAppointmentStore};
pub use loopback::LoopbackNetwork;
pub use memory_relay::MemoryRelay;
pub use peer::{EngineFactory, PeerConnectionManager, PeerEvent};
pub use provider::{ConfiguredDependencies, DependencyProvider};
pub use realtime::SupabaseRealtimeTransport;
pub use registry::{CallKey, CallRegistry};
pub use relay::{RelayTransport, SignalingRelayClient};
pub use rtc::WebRtcEngineFactory;
pub use session::{CallDependencies, CallSessionController, Liveness};
