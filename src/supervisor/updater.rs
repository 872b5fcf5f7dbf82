//! Pushing desired-config changes to running workers.
//!
//! Planning happens under the registry lock and only touches in-memory
//! state: reattach lists and connection maps are updated, and workers that
//! cannot take a live update are evicted so the next request restarts them.
//! The RPCs collected by the plan are sent after the lock is released.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;

use super::capability::ConnectionProtocol;
use super::diff::ConnectionDiff;
use super::error::{SupervisorError, SupervisorResult};
use super::launcher::LaunchPlan;
use super::listener::NotificationListener;
use super::reattach::ReattachInfo;
use super::registry::{Registry, RegistryInner, WorkerId, WorkerState};
use crate::config::{ConnectionConfigMap, LogicalConnection};
use crate::worker::protocol::UpdateConnectionConfigsRequest;
use crate::worker::{PluginClient, WorkerError};

/// One batched update for a multiplexing worker.
pub(crate) struct PendingUpdate {
    worker_id: WorkerId,
    plugin: String,
    client: Arc<dyn PluginClient>,
    protocol: Arc<dyn ConnectionProtocol>,
    message_stream: bool,
    request: UpdateConnectionConfigsRequest,
}

/// RPCs to send once the registry lock is released.
#[derive(Default)]
pub(crate) struct UpdatePlan {
    updates: Vec<PendingUpdate>,
    /// Kinds whose workers were evicted for a restart.
    restarted: Vec<String>,
}

impl UpdatePlan {
    pub(crate) fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.restarted.is_empty()
    }
}

/// Replace the desired configuration and plan the resulting updates.
///
/// Must be called with the registry lock held.
pub(crate) fn plan_config_change(inner: &mut RegistryInner, new: ConnectionConfigMap) -> UpdatePlan {
    let diff = ConnectionDiff::compute(&inner.desired, &new);
    inner.desired = new;
    inner.rebuild_indexes();

    if diff.is_empty() {
        return UpdatePlan::default();
    }
    tracing::debug!(changes = diff.len(), plugins = diff.plugins().len(), "connection config changed");
    inner.bump_generations(diff.plugins().iter());

    let mut plan = UpdatePlan::default();
    for plugin in diff.plugins() {
        plan_kind(inner, &mut plan, &plugin, &diff);
    }
    plan
}

/// Plan the update of one worker kind for `diff`.
fn plan_kind(inner: &mut RegistryInner, plan: &mut UpdatePlan, plugin: &str, diff: &ConnectionDiff) {
    let group = |g: &BTreeMap<String, Vec<LogicalConnection>>| g.get(plugin).cloned().unwrap_or_default();
    let added = group(&diff.added);
    let deleted = group(&diff.deleted);
    let changed = group(&diff.changed);

    if let Some(id) = inner.multiplexing.get(plugin).copied() {
        let Some(worker) = inner.workers.get_mut(&id) else {
            return;
        };
        let (Some(client), Some(protocol)) = (worker.client.clone(), worker.protocol.clone()) else {
            return;
        };

        if !protocol.supports_live_update() {
            tracing::info!(plugin, "plugin cannot update connections live, restarting");
            inner.evict(id);
            plan.restarted.push(plugin.to_string());
            return;
        }

        let message_stream = worker
            .reattach
            .as_ref()
            .is_some_and(|r| r.supported_operations.message_stream);
        if let Some(info) = worker.reattach.as_mut() {
            for conn in &added {
                info.add_connection(&conn.name);
            }
            for conn in &deleted {
                info.remove_connection(&conn.name);
            }
        }
        for conn in &added {
            inner.by_connection.insert(conn.name.clone(), id);
        }
        for conn in &deleted {
            if inner.by_connection.get(&conn.name) == Some(&id) {
                inner.by_connection.remove(&conn.name);
            }
        }

        plan.updates.push(PendingUpdate {
            worker_id: id,
            plugin: plugin.to_string(),
            client,
            protocol,
            message_stream,
            request: UpdateConnectionConfigsRequest {
                added,
                deleted,
                changed,
            },
        });
        return;
    }

    // Legacy workers see a change only through a restart.
    for conn in deleted.iter().chain(changed.iter()) {
        let Some(id) = inner.by_connection.get(&conn.name).copied() else {
            continue;
        };
        let restart = inner.workers.get(&id).is_some_and(|w| {
            w.plugin == plugin && w.state() == WorkerState::Ready && !w.is_multiplexing()
        });
        if restart {
            tracing::info!(plugin, connection = %conn.name, "connection config changed, restarting plugin");
            inner.evict(id);
            plan.restarted.push(plugin.to_string());
        }
    }
}

/// Sends planned updates and keeps served connections in sync.
#[derive(Clone)]
pub struct LiveUpdater {
    registry: Arc<Registry>,
    listener: NotificationListener,
}

impl LiveUpdater {
    pub fn new(registry: Arc<Registry>, listener: NotificationListener) -> Self {
        Self { registry, listener }
    }

    /// Replace the desired configuration and push the diff to running workers.
    ///
    /// Returns [`SupervisorError::ConfigUpdateFailed`] naming each kind whose
    /// update failed; every other kind is still updated.
    pub async fn apply(&self, new: ConnectionConfigMap) -> SupervisorResult<()> {
        let plan = {
            let mut inner = self.registry.lock()?;
            if inner.is_shutting_down() {
                return Err(SupervisorError::ShuttingDown);
            }
            plan_config_change(&mut inner, new)
        };
        self.send(plan).await
    }

    async fn send(&self, plan: UpdatePlan) -> SupervisorResult<()> {
        if plan.is_empty() {
            return Ok(());
        }
        for plugin in &plan.restarted {
            tracing::debug!(plugin = %plugin, "plugin will restart on next request");
        }

        let results = join_all(plan.updates.into_iter().map(|update| self.send_one(update))).await;

        let failures: BTreeMap<String, String> = results.into_iter().flatten().collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::ConfigUpdateFailed(failures))
        }
    }

    /// Send one update. Returns the kind and reason on failure.
    async fn send_one(&self, update: PendingUpdate) -> Option<(String, String)> {
        let PendingUpdate {
            worker_id,
            plugin,
            client,
            protocol,
            message_stream,
            request,
        } = update;

        match protocol.apply_live_update(client.as_ref(), request).await {
            Ok(outcome) => {
                let refused: Vec<String> = outcome.failed.keys().cloned().collect();
                for (connection, reason) in &outcome.failed {
                    tracing::warn!(plugin = %plugin, connection = %connection, reason = %reason, "plugin rejected connection");
                }
                if !refused.is_empty() {
                    if let Err(e) = self.registry.forget_connections(worker_id, &refused) {
                        return Some((plugin, e.to_string()));
                    }
                }
                if message_stream && !outcome.served.is_empty() {
                    self.listener.start(&plugin, client, &outcome.served).await;
                }
                None
            }
            Err(e) => {
                tracing::warn!(plugin = %plugin, error = %e, "live config update failed, restarting plugin");
                if let Err(evict_err) = self.registry.evict(worker_id) {
                    tracing::error!(plugin = %plugin, error = %evict_err, "failed to evict plugin");
                }
                Some((plugin, e.to_string()))
            }
        }
    }

    /// Teach a running multiplexing worker one connection it does not serve yet.
    ///
    /// Returns `Ok(None)` when the worker was evicted instead and must be
    /// started again.
    pub async fn catch_up(
        &self,
        id: WorkerId,
        conn: &LogicalConnection,
    ) -> SupervisorResult<Option<ReattachInfo>> {
        let (client, protocol, message_stream) = {
            let inner = self.registry.lock()?;
            let Some(worker) = inner.workers.get(&id) else {
                return Ok(None);
            };
            let (Some(client), Some(protocol)) = (worker.client.clone(), worker.protocol.clone())
            else {
                return Ok(None);
            };
            let message_stream = worker
                .reattach
                .as_ref()
                .is_some_and(|r| r.supported_operations.message_stream);
            (client, protocol, message_stream)
        };

        if !protocol.supports_live_update() {
            tracing::info!(plugin = %conn.plugin, connection = %conn.name, "plugin cannot add connections live, restarting");
            self.registry.evict(id)?;
            return Ok(None);
        }

        let request = UpdateConnectionConfigsRequest {
            added: vec![conn.clone()],
            ..Default::default()
        };
        match protocol.apply_live_update(client.as_ref(), request).await {
            Ok(outcome) => {
                if let Some(reason) = outcome.failed.get(&conn.name) {
                    return Err(SupervisorError::launch(
                        &conn.plugin,
                        WorkerError::ConnectionConfigFailed(format!("{}: {}", conn.name, reason)),
                    ));
                }
                let names = vec![conn.name.clone()];
                let info = self
                    .registry
                    .record_served(id, &names)?
                    .filter(|info| info.serves(&conn.name));
                if info.is_none() {
                    tracing::debug!(plugin = %conn.plugin, connection = %conn.name, "connection no longer served after catch-up");
                    return Ok(None);
                }
                if message_stream {
                    self.listener.start(&conn.plugin, client, &names).await;
                }
                Ok(info)
            }
            Err(e) => {
                tracing::warn!(plugin = %conn.plugin, error = %e, "failed to add connection, restarting plugin");
                self.registry.evict(id)?;
                Ok(None)
            }
        }
    }

    /// Bring a freshly started worker up to date with config changes that
    /// happened while it was starting.
    ///
    /// A legacy worker only ever serves its trigger, so only that connection
    /// is compared; its siblings belong to other processes.
    pub async fn resync(&self, plan: &LaunchPlan) -> SupervisorResult<()> {
        let update = {
            let mut inner = self.registry.lock()?;
            let multiplexing = inner
                .workers
                .get(&plan.worker_id)
                .is_some_and(|w| w.is_multiplexing());
            let in_scope = |c: &LogicalConnection| multiplexing || c.name == plan.trigger.name;
            let sent: ConnectionConfigMap = plan
                .kind_connections
                .iter()
                .chain(std::iter::once(&plan.trigger))
                .filter(|c| in_scope(c))
                .map(|c| (c.name.clone(), c.clone()))
                .collect();
            let current: ConnectionConfigMap = inner
                .plugin_connections
                .get(&plan.plugin)
                .into_iter()
                .flatten()
                .filter(|c| in_scope(c))
                .map(|c| (c.name.clone(), c.clone()))
                .collect();
            let diff = ConnectionDiff::compute(&sent, &current);
            let mut update = UpdatePlan::default();
            if diff.is_empty() {
                return Ok(());
            }
            tracing::debug!(plugin = %plan.plugin, changes = diff.len(), "config changed during plugin startup");
            plan_kind(&mut inner, &mut update, &plan.plugin, &diff);
            update
        };
        self.send(update).await
    }
}
