//! Centralized configuration for the broker and the lock.
//!
//! Transport limits live in [`OrbConfig`] as constants; per-process settings
//! that a binary fills from its command line live in [`NodeConfig`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Transport-level configuration.
pub struct OrbConfig;

impl OrbConfig {
    /// Largest accepted wire record, newline included.
    pub const MAX_RECORD_SIZE: usize = 1_048_576; // 1MB
    /// Concurrent connection handlers per skeleton.
    pub const MAX_CONNECTIONS: usize = 256;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Upper bound for a whole stub round trip once connected.
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_NAME_SERVICE_PORT: u16 = 8000;
}

/// Peer type names registered with the name service.
pub struct PeerTypes;

impl PeerTypes {
    pub const FORTUNE: &'static str = "fortune";
}

/// Runtime settings for one fortune node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Peer type used to find the other members of the group.
    pub peer_type: String,
    /// Host to listen on. Empty means "the host name of this machine".
    pub host: String,
    /// Port to listen on (0 = auto-assign).
    pub port: u16,
    /// Address of the name service, `host:port`.
    pub name_service: String,
    /// Fortune database file shared by the group.
    pub database: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_type: PeerTypes::FORTUNE.to_string(),
            host: String::new(),
            port: 0,
            name_service: format!("127.0.0.1:{}", OrbConfig::DEFAULT_NAME_SERVICE_PORT),
            database: PathBuf::from("fortunes.db"),
        }
    }
}

impl NodeConfig {
    /// Local bind address as `host:port`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
