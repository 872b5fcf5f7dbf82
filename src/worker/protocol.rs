//! Protocol types for plugin worker communication.
//!
//! Requests and responses are newline-delimited JSON envelopes exchanged over
//! the TCP address a worker announces in its handshake. The same envelope
//! format is served by the supervisor's own process-level facade.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::LogicalConnection;

// ============================================================================
// Request/Response Envelope
// ============================================================================

/// Request envelope sent to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique request ID for correlation.
    pub id: String,
    /// Method name (e.g., "plugin.get_supported_operations").
    pub method: String,
    /// Method-specific parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Response envelope received from a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to.
    pub id: String,
    /// Whether the request succeeded.
    pub success: bool,
    /// Result data (present if success = true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error information (present if success = false).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ResponseEnvelope {
    /// Build a successful response.
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Build a failed response.
    pub fn err(id: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(ErrorInfo {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

/// Error information in a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// Error codes shared by workers and the supervisor facade.
pub mod codes {
    pub const NOT_IMPLEMENTED: &str = "NOT_IMPLEMENTED";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
    pub const CONNECTION_CONFIG_FAILED: &str = "CONNECTION_CONFIG_FAILED";
    pub const INTERNAL: &str = "INTERNAL";
    pub const WORKER_EXITED: &str = "WORKER_EXITED";
}

// ============================================================================
// Capabilities
// ============================================================================

/// Optional operations a worker declares through
/// `plugin.get_supported_operations`.
///
/// Workers that predate the query are treated as supporting none of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupportedOperations {
    /// One process can serve many connections.
    pub multiple_connections: bool,
    /// Accepts `plugin.update_connection_configs` without restarting.
    pub live_config_update: bool,
    /// Can stream query results into the shared cache.
    pub cache_stream: bool,
    /// Supports `plugin.establish_message_stream`.
    pub message_stream: bool,
}

// ============================================================================
// Connection Config Handoff
// ============================================================================

/// Parameters for `plugin.set_all_connection_configs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetAllConnectionConfigsRequest {
    /// Every connection currently desired for the worker kind.
    pub configs: Vec<LogicalConnection>,
    /// Cache budget for this worker in MB (0 = unlimited).
    pub max_cache_size_mb: u64,
}

/// Parameters for `plugin.set_connection_config` (legacy workers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetConnectionConfigRequest {
    /// Connection name.
    pub connection: String,
    /// Opaque config payload.
    pub config: String,
}

/// Parameters for `plugin.update_connection_configs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConnectionConfigsRequest {
    #[serde(default)]
    pub added: Vec<LogicalConnection>,
    #[serde(default)]
    pub deleted: Vec<LogicalConnection>,
    #[serde(default)]
    pub changed: Vec<LogicalConnection>,
}

impl UpdateConnectionConfigsRequest {
    /// True when there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.changed.is_empty()
    }
}

/// Response from the config handoff methods.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetConnectionConfigsResponse {
    /// Connections the worker refused, with the reason.
    #[serde(default)]
    pub failed_connections: HashMap<String, String>,
}

// ============================================================================
// Message Stream
// ============================================================================

/// Parameters for `plugin.establish_message_stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstablishMessageStreamParams {
    /// Connection the stream reports on.
    pub connection: String,
}

/// Kind of out-of-band message sent by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginMessageType {
    /// The schema of a connection changed and must be refreshed.
    SchemaUpdated,
    /// A message type this host does not understand.
    #[serde(other)]
    Unknown,
}

/// Out-of-band message received on a message stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMessage {
    pub message_type: PluginMessageType,
    pub connection: String,
}

// ============================================================================
// Method Names
// ============================================================================

/// Worker method names.
pub mod methods {
    pub const GET_SUPPORTED_OPERATIONS: &str = "plugin.get_supported_operations";
    pub const SET_ALL_CONNECTION_CONFIGS: &str = "plugin.set_all_connection_configs";
    pub const SET_CONNECTION_CONFIG: &str = "plugin.set_connection_config";
    pub const UPDATE_CONNECTION_CONFIGS: &str = "plugin.update_connection_configs";
    pub const ESTABLISH_MESSAGE_STREAM: &str = "plugin.establish_message_stream";
}
