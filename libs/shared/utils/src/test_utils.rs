use std::sync::Arc;
use uuid::Uuid;

use shared_config::{AppConfig, NegotiationMode, DEFAULT_ICE_SERVER};

pub struct TestConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub negotiation_mode: NegotiationMode,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            negotiation_mode: NegotiationMode::Loopback,
        }
    }
}

impl TestConfig {
    pub fn with_supabase_url(url: impl Into<String>) -> Self {
        Self {
            supabase_url: url.into(),
            ..Self::default()
        }
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            negotiation_mode: self.negotiation_mode,
            relay_join_timeout_secs: 2,
            relay_heartbeat_secs: 25,
            agent_port: 0,
        }
    }

    pub fn to_arc(&self) -> Arc<AppConfig> {
        Arc::new(self.to_app_config())
    }
}

/// A consultation participant as the profile service would describe it.
pub struct TestParticipant {
    pub id: String,
    pub full_name: String,
    pub role: String,
}

impl TestParticipant {
    pub fn new(full_name: &str, role: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            full_name: full_name.to_string(),
            role: role.to_string(),
        }
    }

    pub fn doctor(full_name: &str) -> Self {
        Self::new(full_name, "doctor")
    }

    pub fn parent(full_name: &str) -> Self {
        Self::new(full_name, "parent")
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }
}

/// Fresh appointment identifier so concurrent tests never share a relay scope.
pub fn test_appointment_id() -> String {
    Uuid::new_v4().to_string()
}
