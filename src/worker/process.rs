//! Spawning plugin processes.
//!
//! [`ProcessSpawner`] verifies the executable checksum, starts the plugin with
//! the magic cookie in its environment, reads the handshake line from stdout
//! and connects a [`WorkerClient`] to the announced address. Any failure after
//! the process started kills it before the error is returned.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

use super::checksum::{checksum_matches, file_checksum};
use super::client::{PluginClient, WorkerClient, DEFAULT_TIMEOUT_SECS};
use super::error::{WorkerError, WorkerResult};
use super::handshake::{Handshake, CHECKSUM_ENV_KEY, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE};
use crate::config::PluginSettings;

/// OS-level handle of a started plugin.
pub trait WorkerProcess: Send + Sync {
    /// Process ID.
    fn pid(&self) -> u32;

    /// Whether the process still exists.
    fn is_alive(&mut self) -> bool;

    /// Send a kill signal. Does not wait for exit.
    fn kill(&mut self) -> io::Result<()>;
}

/// A plugin process that completed its handshake.
pub struct SpawnedWorker {
    pub process: Box<dyn WorkerProcess>,
    pub client: Arc<dyn PluginClient>,
    pub handshake: Handshake,
    /// SHA-256 of the executable that was started.
    pub checksum: String,
}

/// Starts plugin processes.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Start the plugin binary for `kind` and complete the handshake.
    async fn spawn(&self, kind: &str, plugin: &PluginSettings) -> WorkerResult<SpawnedWorker>;
}

/// Check whether a PID refers to a live process.
#[cfg(unix)]
pub fn pid_exists(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // Signal 0 performs the permission and existence checks only.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Check whether a PID refers to a live process.
#[cfg(not(unix))]
pub fn pid_exists(pid: u32) -> bool {
    pid != 0
}

/// A child process started by [`ProcessSpawner`].
pub struct ChildProcess {
    child: Child,
    pid: u32,
}

impl ChildProcess {
    fn new(child: Child) -> io::Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "process exited before handshake"))?;
        Ok(Self { child, pid })
    }
}

impl WorkerProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => false,
            _ => pid_exists(self.pid),
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

/// Spawns real plugin executables.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    handshake_timeout: Duration,
    request_timeout: Duration,
}

impl Default for ProcessSpawner {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl ProcessSpawner {
    /// Create a spawner with explicit timeouts.
    pub fn new(handshake_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            handshake_timeout,
            request_timeout,
        }
    }

    /// Read the handshake line, skipping blank lines.
    async fn read_handshake(&self, stdout: &mut BufReader<ChildStdout>) -> WorkerResult<Handshake> {
        let read = async {
            let mut line = String::new();
            loop {
                line.clear();
                let n = stdout
                    .read_line(&mut line)
                    .await
                    .map_err(WorkerError::ReadFailed)?;
                if n == 0 {
                    return Err(WorkerError::HandshakeFailed(
                        "plugin exited before handshake".to_string(),
                    ));
                }
                if !line.trim().is_empty() {
                    return Handshake::parse(&line);
                }
            }
        };

        match tokio::time::timeout(self.handshake_timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::HandshakeFailed(format!(
                "no handshake within {}s",
                self.handshake_timeout.as_secs()
            ))),
        }
    }

    async fn connect(
        &self,
        kind: &str,
        process: &mut ChildProcess,
        stdout: ChildStdout,
    ) -> WorkerResult<(Handshake, WorkerClient)> {
        let mut stdout = BufReader::new(stdout);
        let handshake = self.read_handshake(&mut stdout).await?;
        let client =
            WorkerClient::connect_with_timeout(&handshake.address, self.request_timeout).await?;

        // Keep draining stdout so the plugin never blocks on a full pipe.
        let plugin = kind.to_string();
        let pid = process.pid();
        tokio::spawn(async move {
            let mut lines = stdout.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(plugin = %plugin, pid, "{}", line);
            }
        });

        Ok((handshake, client))
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, kind: &str, plugin: &PluginSettings) -> WorkerResult<SpawnedWorker> {
        let path = plugin.resolved_path().map_err(|e| {
            WorkerError::SpawnFailed(io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
        })?;

        let checksum = file_checksum(&path).await.map_err(WorkerError::SpawnFailed)?;
        if let Some(expected) = &plugin.checksum {
            if !checksum_matches(expected, &checksum) {
                return Err(WorkerError::ChecksumMismatch {
                    path: path.display().to_string(),
                    expected: expected.clone(),
                    actual: checksum,
                });
            }
        }

        let mut child = Command::new(&path)
            .args(&plugin.args)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env(CHECKSUM_ENV_KEY, &checksum)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::SpawnFailed)?;

        let stdout = child.stdout.take();
        let mut process = ChildProcess::new(child).map_err(WorkerError::SpawnFailed)?;
        let stdout = match stdout {
            Some(stdout) => stdout,
            None => {
                let _ = process.kill();
                return Err(WorkerError::SpawnFailed(io::Error::new(
                    io::ErrorKind::Other,
                    "stdout not captured",
                )));
            }
        };

        match self.connect(kind, &mut process, stdout).await {
            Ok((handshake, client)) => {
                tracing::debug!(
                    plugin = %kind,
                    pid = process.pid(),
                    address = %handshake.address,
                    "plugin handshake complete"
                );
                Ok(SpawnedWorker {
                    process: Box::new(process),
                    client: Arc::new(client),
                    handshake,
                    checksum,
                })
            }
            Err(e) => {
                tracing::warn!(plugin = %kind, pid = process.pid(), error = %e, "killing plugin after failed handshake");
                let _ = process.kill();
                Err(e)
            }
        }
    }
}
