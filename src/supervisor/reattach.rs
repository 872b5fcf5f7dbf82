//! Reattach information for running plugins.

use serde::{Deserialize, Serialize};

use crate::worker::protocol::SupportedOperations;
use crate::worker::Handshake;

/// Everything a client needs to open an RPC connection to an already
/// running plugin without spawning it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReattachInfo {
    /// Worker kind.
    pub plugin: String,
    /// RPC protocol name.
    pub protocol: String,
    /// Negotiated protocol version.
    pub protocol_version: u32,
    /// Process ID of the plugin.
    pub pid: u32,
    /// Network type of `address`.
    pub network: String,
    /// Address to reconnect to.
    pub address: String,
    /// Optional operations the plugin declared.
    pub supported_operations: SupportedOperations,
    /// Connections this process currently serves.
    pub connections: Vec<String>,
}

impl ReattachInfo {
    /// Build reattach info from a completed handshake.
    pub fn new(
        plugin: impl Into<String>,
        pid: u32,
        handshake: &Handshake,
        supported_operations: SupportedOperations,
        connections: Vec<String>,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            protocol: handshake.protocol.clone(),
            protocol_version: handshake.protocol_version,
            pid,
            network: handshake.network.clone(),
            address: handshake.address.clone(),
            supported_operations,
            connections,
        }
    }

    /// Whether this process serves `connection`.
    pub fn serves(&self, connection: &str) -> bool {
        self.connections.iter().any(|c| c == connection)
    }

    /// Record that this process serves `connection`. No-op if already present.
    pub fn add_connection(&mut self, connection: &str) {
        if !self.serves(connection) {
            self.connections.push(connection.to_string());
        }
    }

    /// Record that this process no longer serves `connection`. No-op if absent.
    pub fn remove_connection(&mut self, connection: &str) {
        self.connections.retain(|c| c != connection);
    }
}
