//! Plugin startup handshake.
//!
//! A plugin is started with the magic cookie in its environment and must
//! answer with a single line on stdout:
//!
//! ```text
//! <core_version>|<app_version>|<network>|<address>|<protocol>
//! 1|1|tcp|127.0.0.1:53122|ndjson
//! ```
//!
//! The supervisor's own facade announces itself with the same line.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{WorkerError, WorkerResult};

/// Environment variable carrying the magic cookie.
pub const MAGIC_COOKIE_KEY: &str = "CONDUIT_PLUGIN_MAGIC_COOKIE";

/// Expected magic cookie value.
pub const MAGIC_COOKIE_VALUE: &str = "5f1b1c8e-2a7d-4c1e-9a65-conduit-plugin";

/// Environment variable carrying the executable checksum.
pub const CHECKSUM_ENV_KEY: &str = "CONDUIT_PLUGIN_CHECKSUM";

/// Core handshake protocol version.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Application protocol versions this host can speak.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[u32] = &[1];

/// RPC protocol name.
pub const PROTOCOL_NAME: &str = "ndjson";

/// Network type for RPC connections.
pub const NETWORK_TCP: &str = "tcp";

/// Parsed handshake line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Core handshake version.
    pub core_version: u32,
    /// Negotiated application protocol version.
    pub protocol_version: u32,
    /// Network type ("tcp").
    pub network: String,
    /// Address to reconnect to.
    pub address: String,
    /// RPC protocol name ("ndjson").
    pub protocol: String,
}

impl Handshake {
    /// Handshake for a listener bound at `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            protocol_version: SUPPORTED_PROTOCOL_VERSIONS[0],
            network: NETWORK_TCP.to_string(),
            address: address.into(),
            protocol: PROTOCOL_NAME.to_string(),
        }
    }

    /// Parse and validate a handshake line.
    pub fn parse(line: &str) -> WorkerResult<Self> {
        let line = line.trim();
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 5 {
            return Err(WorkerError::HandshakeFailed(format!(
                "expected 5 fields, got {}: {:?}",
                parts.len(),
                line
            )));
        }

        let core_version: u32 = parts[0].parse().map_err(|_| {
            WorkerError::HandshakeFailed(format!("invalid core version: {}", parts[0]))
        })?;
        if core_version != CORE_PROTOCOL_VERSION {
            return Err(WorkerError::HandshakeFailed(format!(
                "incompatible core version {} (expected {})",
                core_version, CORE_PROTOCOL_VERSION
            )));
        }

        let protocol_version: u32 = parts[1].parse().map_err(|_| {
            WorkerError::HandshakeFailed(format!("invalid protocol version: {}", parts[1]))
        })?;
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&protocol_version) {
            return Err(WorkerError::HandshakeFailed(format!(
                "unsupported protocol version {}",
                protocol_version
            )));
        }

        if parts[2] != NETWORK_TCP {
            return Err(WorkerError::HandshakeFailed(format!(
                "unsupported network: {}",
                parts[2]
            )));
        }
        if parts[3].is_empty() {
            return Err(WorkerError::HandshakeFailed("empty address".to_string()));
        }
        if parts[4] != PROTOCOL_NAME {
            return Err(WorkerError::HandshakeFailed(format!(
                "unsupported protocol: {}",
                parts[4]
            )));
        }

        Ok(Self {
            core_version,
            protocol_version,
            network: parts[2].to_string(),
            address: parts[3].to_string(),
            protocol: parts[4].to_string(),
        })
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_version, self.protocol_version, self.network, self.address, self.protocol
        )
    }
}
