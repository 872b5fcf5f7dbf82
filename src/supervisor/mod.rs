//! Plugin process supervisor.
//!
//! Hands out reattach information for logical connections, starting plugin
//! processes on first use and sharing them between connections when the
//! plugin supports multiplexing.
//!
//! # Architecture
//!
//! ```text
//!   get(["aws_prod", "gcp_dev"])
//!        │
//!        ▼
//! ┌──────────────┐   lookup / claim    ┌───────────────────────────────┐
//! │  Supervisor  │ ──────────────────► │ Registry (one mutex)          │
//! │  (facade)    │ ◄── watch signal ── │ connection -> worker          │
//! └──────┬───────┘                     │ kind -> multiplexing worker   │
//!        │ launch outside the lock     │ kind -> starting worker       │
//!        ▼                             └───────────────────────────────┘
//! ┌──────────────┐  spawn + handshake  ┌───────────────────────────────┐
//! │WorkerLauncher│ ──────────────────► │ plugin process (NDJSON / TCP) │
//! └──────┬───────┘                     └───────────────▲───────────────┘
//!        │ message_stream                              │ update_connection_configs
//!        ▼                                             │
//! ┌──────────────────────┐               ┌─────────────┴───────┐
//! │ NotificationListener │               │ LiveUpdater         │
//! └──────────────────────┘               └─────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use conduit::config::Settings;
//! use conduit::supervisor::{LoggingRefresher, Supervisor};
//!
//! let settings = Settings::load()?;
//! let supervisor = Supervisor::from_settings(&settings, Arc::new(LoggingRefresher))?;
//! supervisor.set_connection_config_map(settings.connection_config_map()?).await?;
//!
//! let response = supervisor.get(&["aws_prod".to_string()]).await?;
//! let info = &response.reattach_map["aws_prod"];
//! ```

mod budget;
mod capability;
mod diff;
mod error;
mod launcher;
mod listener;
mod reattach;
mod registry;
mod state;
mod updater;

pub use budget::{allocate, connection_counts};
pub use capability::{
    protocol_for, ConfigOutcome, ConnectionProtocol, MultiConnectionProtocol,
    SingleConnectionProtocol,
};
pub use diff::{ByPlugin, ConnectionDiff};
pub use error::{SupervisorError, SupervisorResult};
pub use launcher::{LaunchPlan, LaunchedWorker, WorkerLauncher};
pub use listener::{ConnectionRefresher, ListenerOutcome, LoggingRefresher, NotificationListener};
pub use reattach::ReattachInfo;
pub use registry::{
    Claim, Completion, Lookup, Registry, RegistrySnapshot, Verification, WorkerId, WorkerSnapshot,
    WorkerState,
};
pub use state::{StateError, SupervisorState};
pub use updater::LiveUpdater;

use std::any::Any;
use std::collections::HashMap;
use std::env;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{
    parse_duration, ConnectionConfigMap, LogicalConnection, PluginSettings, Settings,
    SettingsError, SupervisorSettings,
};
use crate::worker::{ProcessSpawner, WorkerSpawner};

/// Environment variable overriding the total cache budget.
pub const CACHE_SIZE_ENV: &str = "CONDUIT_CACHE_MAX_SIZE_MB";

/// Tunables of a [`Supervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Bound on waiting for another caller's launch.
    pub startup_timeout: Duration,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    /// Lookup-wait-verify rounds per connection before giving up.
    pub max_resolve_attempts: u32,
    /// Total cache budget in MB (0 = unlimited).
    pub max_cache_size_mb: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            max_resolve_attempts: 3,
            max_cache_size_mb: 0,
        }
    }
}

impl SupervisorConfig {
    /// Build from settings, applying the cache size environment override.
    pub fn from_settings(settings: &SupervisorSettings) -> Result<Self, SettingsError> {
        let max_cache_size_mb = match env::var(CACHE_SIZE_ENV) {
            Ok(value) => value.trim().parse::<u64>().map_err(|_| {
                SettingsError::InvalidConfig(format!(
                    "{} must be a number of megabytes, got '{}'",
                    CACHE_SIZE_ENV, value
                ))
            })?,
            Err(_) => settings.max_cache_size_mb,
        };

        Ok(Self {
            startup_timeout: parse_duration(&settings.startup_timeout)?,
            handshake_timeout: parse_duration(&settings.handshake_timeout)?,
            request_timeout: parse_duration(&settings.request_timeout)?,
            max_resolve_attempts: settings.max_resolve_attempts.max(1),
            max_cache_size_mb,
        })
    }
}

/// Result of [`Supervisor::get`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponse {
    /// connection name -> reattach info
    #[serde(default)]
    pub reattach_map: HashMap<String, ReattachInfo>,
    /// worker kind -> failure reason
    #[serde(default)]
    pub failure_map: HashMap<String, String>,
}

/// Supervises plugin processes for a set of logical connections.
pub struct Supervisor {
    config: SupervisorConfig,
    registry: Arc<Registry>,
    launcher: WorkerLauncher,
    updater: LiveUpdater,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor with an explicit spawner.
    pub fn new(
        config: SupervisorConfig,
        plugins: HashMap<String, PluginSettings>,
        spawner: Arc<dyn WorkerSpawner>,
        refresher: Arc<dyn ConnectionRefresher>,
    ) -> Self {
        let registry = Arc::new(Registry::new(config.max_cache_size_mb));
        let cancel = CancellationToken::new();
        let listener = NotificationListener::new(refresher, cancel.clone());
        Self {
            launcher: WorkerLauncher::new(spawner, plugins, listener.clone()),
            updater: LiveUpdater::new(registry.clone(), listener),
            registry,
            config,
            cancel,
        }
    }

    /// Create a supervisor that spawns real plugin executables.
    pub fn from_settings(
        settings: &Settings,
        refresher: Arc<dyn ConnectionRefresher>,
    ) -> Result<Self, SettingsError> {
        let config = SupervisorConfig::from_settings(&settings.supervisor)?;
        let spawner = ProcessSpawner::new(config.handshake_timeout, config.request_timeout);
        Ok(Self::new(
            config,
            settings.plugins.clone(),
            Arc::new(spawner),
            refresher,
        ))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Resolve reattach info for each of `names`, starting plugins as needed.
    ///
    /// Fails as a whole only if a name is not configured or the supervisor
    /// itself is unusable. Launch failures are reported per worker kind in
    /// [`GetResponse::failure_map`]; once a kind failed, its remaining
    /// connections in this call are skipped.
    pub async fn get(&self, names: &[String]) -> SupervisorResult<GetResponse> {
        recover(self.get_inner(names)).await
    }

    async fn get_inner(&self, names: &[String]) -> SupervisorResult<GetResponse> {
        let mut connections = Vec::with_capacity(names.len());
        for name in names {
            let conn = self
                .registry
                .connection_config(name)?
                .ok_or_else(|| SupervisorError::UnknownConnection(name.clone()))?;
            connections.push(conn);
        }

        let mut response = GetResponse::default();
        for conn in connections {
            if response.failure_map.contains_key(&conn.plugin) {
                continue;
            }
            match self.resolve_or_start(&conn).await {
                Ok(info) => {
                    response.reattach_map.insert(conn.name.clone(), info);
                }
                Err(
                    e @ (SupervisorError::RegistryPoisoned
                    | SupervisorError::ShuttingDown
                    | SupervisorError::Internal(_)),
                ) => return Err(e),
                Err(e) => {
                    tracing::warn!(plugin = %conn.plugin, connection = %conn.name, error = %e, "failed to resolve plugin");
                    response.failure_map.insert(conn.plugin.clone(), e.to_string());
                }
            }
        }
        Ok(response)
    }

    /// Find a usable worker for `conn`, or start one.
    async fn resolve_or_start(&self, conn: &LogicalConnection) -> SupervisorResult<ReattachInfo> {
        let attempts = self.config.max_resolve_attempts;
        // Once a kind is known to be legacy, its starting worker is never ours.
        let mut skip_starting = false;
        let mut stale = None;

        for attempt in 1..=attempts {
            if let Some(found) = self.registry.lookup(&conn.name, &conn.plugin, skip_starting)? {
                self.wait_for_startup(&conn.plugin, found.initialized).await?;

                match self.registry.verify(found.id, &conn.name)? {
                    Verification::Usable(info) => return Ok(info),
                    Verification::NotServing { multiplexing: true } => {
                        if let Some(info) = self.updater.catch_up(found.id, conn).await? {
                            return Ok(info);
                        }
                        stale = Some(found.id);
                    }
                    Verification::NotServing { multiplexing: false } => {
                        skip_starting = true;
                        stale = Some(found.id);
                    }
                    Verification::Dead { pid } => {
                        tracing::info!(plugin = %conn.plugin, connection = %conn.name, pid, "restarting exited plugin");
                        stale = Some(found.id);
                    }
                    Verification::Gone | Verification::NotReady(_) => {
                        stale = None;
                    }
                }
            }

            match self.registry.claim(conn, stale, skip_starting)? {
                Claim::Claimed(plan) => return self.launch(plan, &conn.name).await,
                Claim::Busy => {
                    tracing::debug!(connection = %conn.name, attempt, "registry changed, looking up again");
                }
            }
        }

        Err(SupervisorError::TooManyAttempts {
            connection: conn.name.clone(),
            attempts,
        })
    }

    async fn wait_for_startup(
        &self,
        plugin: &str,
        mut initialized: watch::Receiver<WorkerState>,
    ) -> SupervisorResult<()> {
        let waited = tokio::time::timeout(
            self.config.startup_timeout,
            initialized.wait_for(|state| state.is_terminal()),
        )
        .await;

        match waited {
            Err(_) => Err(SupervisorError::StartupTimeout {
                plugin: plugin.to_string(),
                timeout_ms: self.config.startup_timeout.as_millis(),
            }),
            Ok(Ok(state)) if *state == WorkerState::Ready => Ok(()),
            Ok(_) => Err(SupervisorError::StartupFailed(plugin.to_string())),
        }
    }

    /// Launch the worker for a claimed placeholder and register it.
    async fn launch(&self, plan: LaunchPlan, name: &str) -> SupervisorResult<ReattachInfo> {
        let mut guard = PlaceholderGuard::new(&self.registry, plan.worker_id);
        self.registry.mark_starting(plan.worker_id)?;

        let launched = self.launcher.launch(&plan).await?;
        let completion = self.registry.complete_launch(&plan, launched)?;
        guard.disarm();

        if !completion.config_changed {
            return Ok(completion.reattach);
        }

        if let Err(e) = self.updater.resync(&plan).await {
            tracing::warn!(plugin = %plan.plugin, error = %e, "failed to apply config changed during startup");
        }
        match self.registry.verify(plan.worker_id, name)? {
            Verification::Usable(info) => Ok(info),
            _ => Err(SupervisorError::StartupFailed(plan.plugin)),
        }
    }

    /// Replace the desired configuration.
    ///
    /// Rebuilds the per-kind index and cache budgets, then pushes one batched
    /// update to each running multiplexing worker whose kind changed.
    pub async fn set_connection_config_map(
        &self,
        configs: ConnectionConfigMap,
    ) -> SupervisorResult<()> {
        recover(self.updater.apply(configs)).await
    }

    /// Kill every plugin process and stop all listeners.
    ///
    /// Returns the number of processes signalled. Does not wait for exit.
    pub fn shutdown(&self) -> SupervisorResult<usize> {
        self.cancel.cancel();
        let killed = std::panic::catch_unwind(AssertUnwindSafe(|| self.registry.shutdown()))
            .map_err(|panic| panic_error(panic.as_ref()))??;
        tracing::info!(killed, "plugin supervisor shut down");
        Ok(killed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Point-in-time view of the registry.
    pub fn snapshot(&self) -> SupervisorResult<RegistrySnapshot> {
        self.registry.snapshot()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

/// Removes a claimed placeholder unless the launch registered it.
///
/// Covers launch errors as well as panics and dropped futures.
struct PlaceholderGuard<'a> {
    registry: &'a Registry,
    id: WorkerId,
    armed: bool,
}

impl<'a> PlaceholderGuard<'a> {
    fn new(registry: &'a Registry, id: WorkerId) -> Self {
        Self {
            registry,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PlaceholderGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.registry.abort_launch(self.id) {
                tracing::error!(worker = self.id, error = %e, "failed to remove placeholder");
            }
        }
    }
}

/// Convert a panic inside `fut` into [`SupervisorError::Internal`].
async fn recover<T>(fut: impl Future<Output = SupervisorResult<T>>) -> SupervisorResult<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(panic_error(panic.as_ref())),
    }
}

fn panic_error(payload: &(dyn Any + Send)) -> SupervisorError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(panic = %message, "recovered from panic in plugin supervisor");
    SupervisorError::Internal(message)
}
