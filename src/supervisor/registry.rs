//! Registry of running and starting plugin workers.
//!
//! Workers live in an arena keyed by [`WorkerId`]; the lookup maps hold ids.
//! Every map is guarded by one mutex that is never held across I/O:
//! callers take short critical sections, release the lock, then spawn or wait.
//!
//! A worker entry moves through `Empty -> Starting -> Ready` or ends in
//! `Failed`. The terminal transition is broadcast once to every waiter.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;

use super::budget;
use super::capability::ConnectionProtocol;
use super::error::{SupervisorError, SupervisorResult};
use super::launcher::{LaunchPlan, LaunchedWorker};
use super::reattach::ReattachInfo;
use crate::config::{ConnectionConfigMap, LogicalConnection};
use crate::worker::{PluginClient, WorkerProcess};

/// Identifier of a worker entry in the registry.
pub type WorkerId = u64;

/// Lifecycle state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Placeholder reserved, no process yet.
    Empty,
    /// A caller is spawning the process.
    Starting,
    /// Process running and configured.
    Ready,
    /// Startup failed; the entry is about to be removed.
    Failed,
}

impl WorkerState {
    /// Ready and Failed are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

/// One-shot broadcast of a worker's startup outcome.
#[derive(Debug)]
struct InitSignal {
    tx: watch::Sender<WorkerState>,
}

impl InitSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(WorkerState::Empty);
        Self { tx }
    }

    fn state(&self) -> WorkerState {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.tx.subscribe()
    }

    fn mark_starting(&self) {
        self.tx.send_if_modified(|state| {
            if *state == WorkerState::Empty {
                *state = WorkerState::Starting;
                true
            } else {
                false
            }
        });
    }

    /// Move to a terminal state. Returns false if already closed.
    fn close(&self, outcome: WorkerState) -> bool {
        debug_assert!(outcome.is_terminal());
        self.tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = outcome;
                true
            }
        })
    }
}

/// A spawned (or about to be spawned) plugin process.
pub(crate) struct RunningWorker {
    pub(crate) plugin: String,
    pub(crate) process: Option<Box<dyn WorkerProcess>>,
    pub(crate) client: Option<Arc<dyn PluginClient>>,
    pub(crate) protocol: Option<Arc<dyn ConnectionProtocol>>,
    pub(crate) reattach: Option<ReattachInfo>,
    initialized: InitSignal,
}

impl RunningWorker {
    fn placeholder(plugin: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
            process: None,
            client: None,
            protocol: None,
            reattach: None,
            initialized: InitSignal::new(),
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.initialized.state()
    }

    pub(crate) fn is_multiplexing(&self) -> bool {
        self.protocol
            .as_ref()
            .is_some_and(|p| p.supports_multiplexing())
    }

    fn kill(&mut self) -> Option<u32> {
        let mut process = self.process.take()?;
        let pid = process.pid();
        if let Err(e) = process.kill() {
            tracing::warn!(plugin = %self.plugin, pid, error = %e, "failed to kill plugin process");
        }
        Some(pid)
    }
}

/// Result of a registry lookup for a connection.
pub struct Lookup {
    pub id: WorkerId,
    pub initialized: watch::Receiver<WorkerState>,
}

/// Result of checking a resolved worker after its startup completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Alive and serving the connection.
    Usable(ReattachInfo),
    /// Alive but not serving the connection.
    NotServing { multiplexing: bool },
    /// The process is gone; the entry has been evicted.
    Dead { pid: u32 },
    /// The entry was removed in the meantime.
    Gone,
    /// The entry never became ready.
    NotReady(WorkerState),
}

/// A launch registered by [`Registry::complete_launch`].
#[derive(Debug, Clone)]
pub struct Completion {
    pub reattach: ReattachInfo,
    /// The kind's config changed while the worker was starting.
    pub config_changed: bool,
}

/// Result of trying to reserve a placeholder.
#[derive(Debug)]
pub enum Claim {
    /// This caller owns the launch.
    Claimed(LaunchPlan),
    /// Another caller registered a worker first; look again.
    Busy,
}

/// Mutable registry state. Only touched with the registry lock held.
#[derive(Default)]
pub(crate) struct RegistryInner {
    next_id: WorkerId,
    pub(crate) workers: HashMap<WorkerId, RunningWorker>,
    /// connection name -> worker serving it
    pub(crate) by_connection: HashMap<String, WorkerId>,
    /// worker kind -> multiplexing worker
    pub(crate) multiplexing: HashMap<String, WorkerId>,
    /// worker kind -> worker mid-startup
    pub(crate) starting: HashMap<String, WorkerId>,
    /// worker kind -> desired connections
    pub(crate) plugin_connections: HashMap<String, Vec<LogicalConnection>>,
    /// full desired configuration
    pub(crate) desired: ConnectionConfigMap,
    /// worker kind -> cache budget in MB
    pub(crate) cache_budgets: HashMap<String, u64>,
    /// worker kind -> generation of its last config change
    generations: HashMap<String, u64>,
    generation: u64,
    total_cache_mb: u64,
    shutting_down: bool,
}

impl RegistryInner {
    /// Remove a worker from every map and kill its process.
    pub(crate) fn evict(&mut self, id: WorkerId) -> Option<RunningWorker> {
        let mut worker = self.workers.remove(&id)?;
        self.by_connection.retain(|_, w| *w != id);
        self.multiplexing.retain(|_, w| *w != id);
        self.starting.retain(|_, w| *w != id);
        worker.initialized.close(WorkerState::Failed);
        worker.kill();
        Some(worker)
    }

    /// Recompute the per-kind index and cache budgets from `desired`.
    pub(crate) fn rebuild_indexes(&mut self) {
        let mut by_plugin: HashMap<String, Vec<LogicalConnection>> = HashMap::new();
        for conn in self.desired.values() {
            by_plugin
                .entry(conn.plugin.clone())
                .or_default()
                .push(conn.clone());
        }
        for conns in by_plugin.values_mut() {
            conns.sort_by(|a, b| a.name.cmp(&b.name));
        }

        let counts = budget::connection_counts(self.desired.values());
        self.cache_budgets = budget::allocate(self.total_cache_mb, &counts);
        self.plugin_connections = by_plugin;
    }

    /// Record a config change for `plugins`.
    pub(crate) fn bump_generations<'a>(&mut self, plugins: impl Iterator<Item = &'a String>) {
        self.generation += 1;
        for plugin in plugins {
            self.generations.insert(plugin.clone(), self.generation);
        }
    }

    fn generation_of(&self, plugin: &str) -> u64 {
        self.generations.get(plugin).copied().unwrap_or(0)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }
}

/// Concurrency-safe source of truth for running plugin workers.
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    /// Create an empty registry sharing `total_cache_mb` across plugins.
    pub fn new(total_cache_mb: u64) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                total_cache_mb,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn lock(&self) -> SupervisorResult<MutexGuard<'_, RegistryInner>> {
        Ok(self.inner.lock()?)
    }

    /// Desired configuration of a connection.
    pub fn connection_config(&self, name: &str) -> SupervisorResult<Option<LogicalConnection>> {
        Ok(self.lock()?.desired.get(name).cloned())
    }

    /// Find the worker to wait on for `name`.
    ///
    /// Checks the connection map, then the multiplexing map, then (unless
    /// `skip_starting`) the starting map.
    pub fn lookup(
        &self,
        name: &str,
        plugin: &str,
        skip_starting: bool,
    ) -> SupervisorResult<Option<Lookup>> {
        let inner = self.lock()?;
        if inner.shutting_down {
            return Err(SupervisorError::ShuttingDown);
        }

        let id = inner
            .by_connection
            .get(name)
            .or_else(|| inner.multiplexing.get(plugin))
            .or_else(|| {
                if skip_starting {
                    None
                } else {
                    inner.starting.get(plugin)
                }
            })
            .copied();

        Ok(id.and_then(|id| {
            inner.workers.get(&id).map(|worker| Lookup {
                id,
                initialized: worker.initialized.subscribe(),
            })
        }))
    }

    /// Check that a ready worker is alive and serves `name`.
    ///
    /// A dead worker is evicted from every map as part of the check.
    pub fn verify(&self, id: WorkerId, name: &str) -> SupervisorResult<Verification> {
        let mut inner = self.lock()?;
        let Some(worker) = inner.workers.get_mut(&id) else {
            return Ok(Verification::Gone);
        };

        let state = worker.state();
        if state != WorkerState::Ready {
            return Ok(Verification::NotReady(state));
        }

        let alive = worker.process.as_mut().is_some_and(|p| p.is_alive());
        if !alive {
            let pid = worker.reattach.as_ref().map(|r| r.pid).unwrap_or(0);
            tracing::info!(plugin = %worker.plugin, pid, "plugin process no longer exists");
            inner.evict(id);
            return Ok(Verification::Dead { pid });
        }

        match &worker.reattach {
            Some(info) if info.serves(name) => Ok(Verification::Usable(info.clone())),
            _ => Ok(Verification::NotServing {
                multiplexing: worker.is_multiplexing(),
            }),
        }
    }

    /// Reserve a placeholder for launching the worker that will serve `conn`.
    ///
    /// Returns [`Claim::Busy`] if another caller registered a worker for the
    /// connection (or a startup for the kind) since the last lookup; `stale`
    /// names the worker the caller already rejected.
    pub fn claim(
        &self,
        conn: &LogicalConnection,
        stale: Option<WorkerId>,
        skip_starting: bool,
    ) -> SupervisorResult<Claim> {
        let mut inner = self.lock()?;
        if inner.shutting_down {
            return Err(SupervisorError::ShuttingDown);
        }

        let registered = |id: Option<&WorkerId>| match id {
            Some(id) => Some(*id) != stale,
            None => false,
        };
        if registered(inner.by_connection.get(&conn.name)) {
            return Ok(Claim::Busy);
        }
        if !skip_starting && registered(inner.starting.get(&conn.plugin)) {
            return Ok(Claim::Busy);
        }

        // Re-read under the lock: the config may have changed since lookup.
        let trigger = inner
            .desired
            .get(&conn.name)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownConnection(conn.name.clone()))?;

        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .workers
            .insert(id, RunningWorker::placeholder(&trigger.plugin));
        inner.by_connection.insert(trigger.name.clone(), id);
        inner.starting.insert(trigger.plugin.clone(), id);

        let plan = LaunchPlan {
            worker_id: id,
            plugin: trigger.plugin.clone(),
            kind_connections: inner
                .plugin_connections
                .get(&trigger.plugin)
                .cloned()
                .unwrap_or_default(),
            max_cache_size_mb: inner
                .cache_budgets
                .get(&trigger.plugin)
                .copied()
                .unwrap_or(0),
            generation: inner.generation_of(&trigger.plugin),
            trigger,
        };
        Ok(Claim::Claimed(plan))
    }

    /// The claiming caller is about to spawn.
    pub fn mark_starting(&self, id: WorkerId) -> SupervisorResult<()> {
        let inner = self.lock()?;
        if let Some(worker) = inner.workers.get(&id) {
            worker.initialized.mark_starting();
        }
        Ok(())
    }

    /// Populate a placeholder after a successful launch and wake waiters.
    pub fn complete_launch(
        &self,
        plan: &LaunchPlan,
        launched: LaunchedWorker,
    ) -> SupervisorResult<Completion> {
        let id = plan.worker_id;
        let mut inner = self.lock()?;
        let LaunchedWorker {
            mut process,
            client,
            protocol,
            reattach,
        } = launched;

        if inner.shutting_down || !inner.workers.contains_key(&id) {
            let pid = process.pid();
            tracing::info!(plugin = %reattach.plugin, pid, "discarding plugin started during shutdown");
            let _ = process.kill();
            return Err(if inner.shutting_down {
                SupervisorError::ShuttingDown
            } else {
                SupervisorError::StartupFailed(reattach.plugin)
            });
        }

        let plugin = reattach.plugin.clone();
        let multiplexing = protocol.supports_multiplexing();

        if multiplexing {
            if let Some(old) = inner.multiplexing.get(&plugin).copied() {
                if old != id {
                    tracing::warn!(plugin = %plugin, "replacing existing multiplexing plugin process");
                    inner.evict(old);
                }
            }
            inner.multiplexing.insert(plugin.clone(), id);
        }
        for name in &reattach.connections {
            inner.by_connection.insert(name.clone(), id);
        }
        if inner.starting.get(&plugin) == Some(&id) {
            inner.starting.remove(&plugin);
        }

        let Some(worker) = inner.workers.get_mut(&id) else {
            return Err(SupervisorError::StartupFailed(plugin));
        };
        worker.process = Some(process);
        worker.client = Some(client);
        worker.protocol = Some(protocol);
        worker.reattach = Some(reattach.clone());
        worker.initialized.close(WorkerState::Ready);

        Ok(Completion {
            reattach,
            config_changed: inner.generation_of(&plugin) != plan.generation,
        })
    }

    /// Remove a placeholder after a failed launch.
    pub fn abort_launch(&self, id: WorkerId) -> SupervisorResult<()> {
        let mut inner = self.lock()?;
        if let Some(worker) = inner.workers.get(&id) {
            if worker.state().is_terminal() {
                return Ok(());
            }
        }
        inner.evict(id);
        Ok(())
    }

    /// Evict a worker, killing its process.
    pub fn evict(&self, id: WorkerId) -> SupervisorResult<bool> {
        Ok(self.lock()?.evict(id).is_some())
    }

    /// Record additional connections served by a ready worker.
    ///
    /// Names no longer desired for the worker's kind are skipped: the config
    /// may have changed while the worker was being told about them.
    pub fn record_served(
        &self,
        id: WorkerId,
        names: &[String],
    ) -> SupervisorResult<Option<ReattachInfo>> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let Some(worker) = inner.workers.get_mut(&id) else {
            return Ok(None);
        };
        let Some(info) = worker.reattach.as_mut() else {
            return Ok(None);
        };
        let mut recorded = Vec::with_capacity(names.len());
        for name in names {
            if inner.desired.get(name).is_some_and(|c| c.plugin == worker.plugin) {
                info.add_connection(name);
                recorded.push(name);
            } else {
                tracing::debug!(plugin = %worker.plugin, connection = %name, "connection removed while being added, not recording");
            }
        }
        let info = info.clone();
        for name in recorded {
            inner.by_connection.insert(name.clone(), id);
        }
        Ok(Some(info))
    }

    /// Drop connections a worker refused to serve.
    pub fn forget_connections(&self, id: WorkerId, names: &[String]) -> SupervisorResult<()> {
        let mut inner = self.lock()?;
        if let Some(info) = inner
            .workers
            .get_mut(&id)
            .and_then(|w| w.reattach.as_mut())
        {
            for name in names {
                info.remove_connection(name);
            }
        }
        for name in names {
            if inner.by_connection.get(name) == Some(&id) {
                inner.by_connection.remove(name);
            }
        }
        Ok(())
    }

    /// Kill every process with a handle and clear all maps.
    ///
    /// Entries still starting have no handle and are skipped; their launch
    /// is discarded when it completes. Returns the number of processes
    /// signalled.
    pub fn shutdown(&self) -> SupervisorResult<usize> {
        let mut inner = self.lock()?;
        inner.shutting_down = true;

        let mut killed = 0;
        for worker in inner.workers.values_mut() {
            if let Some(pid) = worker.kill() {
                tracing::debug!(plugin = %worker.plugin, pid, "killed plugin process");
                killed += 1;
            }
            worker.initialized.close(WorkerState::Failed);
        }

        inner.workers.clear();
        inner.by_connection.clear();
        inner.multiplexing.clear();
        inner.starting.clear();
        Ok(killed)
    }

    /// Point-in-time view of the registry.
    pub fn snapshot(&self) -> SupervisorResult<RegistrySnapshot> {
        let inner = self.lock()?;
        Ok(RegistrySnapshot {
            workers: inner
                .workers
                .iter()
                .map(|(id, w)| {
                    (
                        *id,
                        WorkerSnapshot {
                            plugin: w.plugin.clone(),
                            state: w.state(),
                            has_process: w.process.is_some(),
                            reattach: w.reattach.clone(),
                        },
                    )
                })
                .collect(),
            by_connection: inner
                .by_connection
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            multiplexing: inner
                .multiplexing
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            starting: inner
                .starting
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            plugin_connections: inner
                .plugin_connections
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().map(|c| c.name.clone()).collect()))
                .collect(),
            cache_budgets: inner
                .cache_budgets
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        })
    }
}

/// Snapshot of one worker entry.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub plugin: String,
    pub state: WorkerState,
    pub has_process: bool,
    pub reattach: Option<ReattachInfo>,
}

/// Snapshot of the whole registry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySnapshot {
    pub workers: BTreeMap<WorkerId, WorkerSnapshot>,
    pub by_connection: BTreeMap<String, WorkerId>,
    pub multiplexing: BTreeMap<String, WorkerId>,
    pub starting: BTreeMap<String, WorkerId>,
    pub plugin_connections: BTreeMap<String, Vec<String>>,
    pub cache_budgets: BTreeMap<String, u64>,
}

impl RegistrySnapshot {
    /// Workers of one kind.
    pub fn workers_for(&self, plugin: &str) -> Vec<&WorkerSnapshot> {
        self.workers
            .values()
            .filter(|w| w.plugin == plugin)
            .collect()
    }
}
