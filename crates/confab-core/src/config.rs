use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::room::SPAWN_CONTEXT_LIMIT;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1:8080).
    pub bind: SocketAddr,
    /// Per-room envelope retention cap.
    pub max_history: usize,
    /// Interval between server→client pings.
    pub heartbeat_interval: Duration,
    /// Close the connection after this duration without any inbound frame.
    pub idle_timeout: Duration,
    /// Inbound frame size cap.
    pub max_frame_bytes: usize,
    /// Number of trailing envelopes carried as context on a spawn signal.
    pub context_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            max_history: 1000,
            heartbeat_interval: Duration::from_secs(54),
            idle_timeout: Duration::from_secs(60),
            max_frame_bytes: 64 * 1024,
            context_limit: SPAWN_CONTEXT_LIMIT,
        }
    }
}
