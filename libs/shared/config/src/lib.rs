use std::env;
use tracing::warn;

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Which negotiation engine backs the peer connection of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationMode {
    WebRtc,
    Loopback,
}

impl NegotiationMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "webrtc" => Some(Self::WebRtc),
            "loopback" => Some(Self::Loopback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub ice_servers: Vec<String>,
    pub negotiation_mode: NegotiationMode,
    pub relay_join_timeout_secs: u64,
    pub relay_heartbeat_secs: u64,
    pub agent_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            ice_servers: env::var("CALL_ICE_SERVERS")
                .map(|raw| parse_ice_servers(&raw))
                .unwrap_or_else(|_| {
                    warn!("CALL_ICE_SERVERS not set, using default STUN server");
                    vec![DEFAULT_ICE_SERVER.to_string()]
                }),
            negotiation_mode: env::var("CALL_NEGOTIATION")
                .ok()
                .and_then(|raw| {
                    let mode = NegotiationMode::parse(&raw);
                    if mode.is_none() {
                        warn!("CALL_NEGOTIATION has unknown value '{}', using webrtc", raw);
                    }
                    mode
                })
                .unwrap_or(NegotiationMode::WebRtc),
            relay_join_timeout_secs: parse_number("CALL_RELAY_JOIN_TIMEOUT_SECS", 10),
            relay_heartbeat_secs: parse_number("CALL_RELAY_HEARTBEAT_SECS", 25),
            agent_port: parse_number("CALL_AGENT_PORT", 3000),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_anon_key.is_empty()
    }

    /// Realtime signaling needs the project URL and its public key.
    pub fn is_relay_configured(&self) -> bool {
        self.is_configured() && self.relay_heartbeat_secs > 0
    }

    /// Websocket endpoint of the Supabase Realtime service for this project.
    pub fn realtime_url(&self) -> String {
        let base = self.supabase_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };

        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            ws_base, self.supabase_anon_key
        )
    }
}

fn parse_ice_servers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T: std::str::FromStr + std::fmt::Display + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> AppConfig {
        AppConfig {
            supabase_url: url.to_string(),
            supabase_anon_key: "anon".to_string(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            negotiation_mode: NegotiationMode::WebRtc,
            relay_join_timeout_secs: 10,
            relay_heartbeat_secs: 25,
            agent_port: 3000,
        }
    }

    #[test]
    fn test_realtime_url_uses_websocket_scheme() {
        assert_eq!(
            config("https://demo.supabase.co/").realtime_url(),
            "wss://demo.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
        assert_eq!(
            config("http://localhost:54321").realtime_url(),
            "ws://localhost:54321/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[test]
    fn test_ice_server_list_parsing() {
        let servers = parse_ice_servers(" stun:a:3478, ,turn:b:3478 ");
        assert_eq!(servers, vec!["stun:a:3478", "turn:b:3478"]);
    }

    #[test]
    fn test_negotiation_mode_parsing() {
        assert_eq!(NegotiationMode::parse("WebRTC"), Some(NegotiationMode::WebRtc));
        assert_eq!(NegotiationMode::parse(" loopback "), Some(NegotiationMode::Loopback));
        assert_eq!(NegotiationMode::parse("sfu"), None);
    }
}
