use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Shared secret agents must present in their handshake. The server
    /// refuses to start without one.
    pub agent_token: Option<String>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub command_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Consecutive undecodable frames tolerated before the connection is closed.
    pub malformed_frame_limit: u32,
    /// Per-subscriber event inbox depth.
    pub event_buffer: usize,
    /// Static `serverId=agentId` routing entries, e.g. "srv-1=node-1,srv-2=node-1".
    pub server_map: Option<String>,
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(key)
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(default),
    )
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("HELM_GATE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            agent_token: env::var("HELM_AGENT_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            heartbeat_interval: env_secs("HEARTBEAT_INTERVAL", 30),
            heartbeat_timeout: env_secs("HEARTBEAT_TIMEOUT", 15),
            command_timeout: env_secs("COMMAND_TIMEOUT", 30),
            handshake_timeout: env_secs("HANDSHAKE_TIMEOUT", 10),
            malformed_frame_limit: env::var("MALFORMED_FRAME_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            event_buffer: env::var("EVENT_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(256),
            server_map: env::var("HELM_SERVER_MAP").ok(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            agent_token: None,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            malformed_frame_limit: 8,
            event_buffer: 256,
            server_map: None,
        }
    }
}
