//! Supervisor error types.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::worker::WorkerError;

/// Result type for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Errors raised by the plugin supervisor.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// A requested connection is not part of the desired configuration.
    #[error("no config loaded for connection '{0}'")]
    UnknownConnection(String),

    /// No plugin binary is configured for a worker kind.
    #[error("no plugin config loaded for '{plugin}' (connection '{connection}')")]
    PluginNotConfigured { plugin: String, connection: String },

    /// Spawning, handshaking or configuring the plugin failed.
    #[error("failed to start plugin '{plugin}': {source}")]
    Launch {
        plugin: String,
        #[source]
        source: WorkerError,
    },

    /// Another caller's startup did not finish within the wait window.
    #[error("timed out after {timeout_ms}ms waiting for plugin '{plugin}' to start")]
    StartupTimeout { plugin: String, timeout_ms: u128 },

    /// Another caller's startup of the same worker failed.
    #[error("plugin '{0}' failed to start in a concurrent request")]
    StartupFailed(String),

    /// The connection could not be resolved within the attempt cap.
    #[error("gave up resolving connection '{connection}' after {attempts} attempts")]
    TooManyAttempts { connection: String, attempts: u32 },

    /// The supervisor is shutting down.
    #[error("plugin supervisor is shutting down")]
    ShuttingDown,

    /// A panic inside a locked section left the registry unusable.
    #[error("plugin registry is unusable after a panic")]
    RegistryPoisoned,

    /// A panic was caught at the facade boundary.
    #[error("internal supervisor error: {0}")]
    Internal(String),

    /// Live config updates failed for some worker kinds.
    #[error("failed to update plugins: {}", format_failures(.0))]
    ConfigUpdateFailed(BTreeMap<String, String>),
}

impl SupervisorError {
    /// Build a launch error.
    pub fn launch(plugin: impl Into<String>, source: WorkerError) -> Self {
        Self::Launch {
            plugin: plugin.into(),
            source,
        }
    }

    /// Configuration errors are never worth retrying.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownConnection(_) | Self::PluginNotConfigured { .. }
        )
    }
}

fn format_failures(failures: &BTreeMap<String, String>) -> String {
    failures
        .iter()
        .map(|(plugin, reason)| format!("{}: {}", plugin, reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl<T> From<std::sync::PoisonError<T>> for SupervisorError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::RegistryPoisoned
    }
}
