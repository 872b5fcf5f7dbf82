//! Persisted reattach state of the supervisor process itself.
//!
//! `conduit serve` writes this file after binding its RPC address so that
//! `conduit get` and `conduit stop` can find a running supervisor instead of
//! starting a second one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::worker::{pid_exists, Handshake};

/// Errors reading or writing the state file.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid state file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Reattach information for a running supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorState {
    pub pid: u32,
    pub network: String,
    pub address: String,
    pub protocol: String,
    pub protocol_version: u32,
    /// Executable of the supervisor process.
    pub executable: String,
}

impl SupervisorState {
    /// State for the current process, serving at `handshake.address`.
    pub fn current(handshake: &Handshake) -> Self {
        let executable = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Self {
            pid: std::process::id(),
            network: handshake.network.clone(),
            address: handshake.address.clone(),
            protocol: handshake.protocol.clone(),
            protocol_version: handshake.protocol_version,
            executable,
        }
    }

    /// Load the state file. Returns `None` if it does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, StateError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StateError::Json {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Write the state file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| StateError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(io_err)
    }

    /// Remove the state file. Missing files are not an error.
    pub fn delete(path: &Path) -> Result<(), StateError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Whether the recorded process still exists.
    pub fn is_running(&self) -> bool {
        pid_exists(self.pid)
    }
}
