//! Worker-specific error types.

use std::io;
use thiserror::Error;

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors that can occur while spawning or talking to a plugin worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Failed to spawn the worker process.
    #[error("failed to spawn plugin process: {0}")]
    SpawnFailed(#[source] io::Error),

    /// The worker printed a malformed or incompatible handshake line.
    #[error("plugin handshake failed: {0}")]
    HandshakeFailed(String),

    /// The plugin binary does not match the expected checksum.
    #[error("plugin checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Path of the binary that was hashed.
        path: String,
        /// Checksum from the plugin settings.
        expected: String,
        /// Checksum computed from the binary on disk.
        actual: String,
    },

    /// Failed to connect to the address announced in the handshake.
    #[error("failed to connect to plugin at {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Failed to write to the worker connection.
    #[error("failed to write to plugin: {0}")]
    WriteFailed(#[source] io::Error),

    /// Failed to read from the worker connection.
    #[error("failed to read from plugin: {0}")]
    ReadFailed(#[source] io::Error),

    /// Failed to serialize request to JSON.
    #[error("failed to serialize request: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// Failed to deserialize response from JSON.
    #[error("failed to deserialize response: {0}")]
    DeserializeFailed(#[source] serde_json::Error),

    /// Request timed out waiting for response.
    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    /// Worker process exited unexpectedly.
    #[error("plugin process exited unexpectedly")]
    WorkerExited,

    /// Response channel was closed (internal error).
    #[error("response channel closed unexpectedly")]
    ChannelClosed,

    /// A message stream reached its end.
    #[error("message stream closed")]
    StreamClosed,

    /// Worker returned an error response.
    #[error("plugin error: {message} (code: {code})")]
    Remote {
        /// Error code from worker.
        code: String,
        /// Error message from worker.
        message: String,
    },

    /// The worker does not implement the requested method.
    #[error("not implemented by plugin: {0}")]
    NotImplemented(String),

    /// Invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Method not found.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// The worker rejected a connection config.
    #[error("connection config rejected: {0}")]
    ConnectionConfigFailed(String),
}

impl WorkerError {
    /// Create a remote error from an error response.
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Check if this error indicates the worker has exited.
    pub fn is_worker_exited(&self) -> bool {
        matches!(self, Self::WorkerExited | Self::ChannelClosed)
    }

    /// Check if the worker answered that it does not implement the call.
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Self::NotImplemented(_) | Self::MethodNotFound(_))
    }

    /// Check if this error marks the regular end of a message stream.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::StreamClosed | Self::WorkerExited)
    }

    /// Check if this error is retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::WorkerExited | Self::ChannelClosed
        )
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        Self::DeserializeFailed(err)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for WorkerError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}
