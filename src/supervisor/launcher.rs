//! Starting a plugin worker for a claimed placeholder.

use std::collections::HashMap;
use std::sync::Arc;

use super::capability::{protocol_for, ConnectionProtocol};
use super::error::{SupervisorError, SupervisorResult};
use super::listener::{ListenerOutcome, NotificationListener};
use super::reattach::ReattachInfo;
use super::registry::WorkerId;
use crate::config::{LogicalConnection, PluginSettings};
use crate::worker::protocol::SupportedOperations;
use crate::worker::{PluginClient, SpawnedWorker, WorkerProcess, WorkerSpawner};

/// Everything needed to start a worker, captured under the registry lock.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub worker_id: WorkerId,
    pub plugin: String,
    /// Connection whose request caused the launch.
    pub trigger: LogicalConnection,
    /// Every desired connection of the kind at claim time.
    pub kind_connections: Vec<LogicalConnection>,
    pub max_cache_size_mb: u64,
    /// Config generation of the kind at claim time.
    pub generation: u64,
}

/// A started and configured worker, ready to be registered.
pub struct LaunchedWorker {
    pub process: Box<dyn WorkerProcess>,
    pub client: Arc<dyn PluginClient>,
    pub protocol: Arc<dyn ConnectionProtocol>,
    pub reattach: ReattachInfo,
}

/// Spawns workers and performs the initial config handoff.
pub struct WorkerLauncher {
    spawner: Arc<dyn WorkerSpawner>,
    plugins: HashMap<String, PluginSettings>,
    listener: NotificationListener,
}

impl WorkerLauncher {
    pub fn new(
        spawner: Arc<dyn WorkerSpawner>,
        plugins: HashMap<String, PluginSettings>,
        listener: NotificationListener,
    ) -> Self {
        Self {
            spawner,
            plugins,
            listener,
        }
    }

    /// Start the worker described by `plan`.
    ///
    /// On any failure after the process started, the process is killed
    /// before the error is returned.
    pub async fn launch(&self, plan: &LaunchPlan) -> SupervisorResult<LaunchedWorker> {
        let settings = self.plugins.get(&plan.plugin).ok_or_else(|| {
            SupervisorError::PluginNotConfigured {
                plugin: plan.plugin.clone(),
                connection: plan.trigger.name.clone(),
            }
        })?;

        tracing::info!(plugin = %plan.plugin, connection = %plan.trigger.name, "starting plugin");
        let SpawnedWorker {
            mut process,
            client,
            handshake,
            checksum,
        } = self
            .spawner
            .spawn(&plan.plugin, settings)
            .await
            .map_err(|e| SupervisorError::launch(&plan.plugin, e))?;
        let pid = process.pid();
        tracing::debug!(plugin = %plan.plugin, pid, checksum = %checksum, address = %handshake.address, "plugin handshake complete");

        let ops = match client.get_supported_operations().await {
            Ok(ops) => ops,
            Err(e) => {
                tracing::debug!(plugin = %plan.plugin, error = %e, "supported operations unavailable, assuming none");
                SupportedOperations::default()
            }
        };
        let protocol = protocol_for(&ops);

        let outcome = match protocol
            .apply_initial_config(
                client.as_ref(),
                &plan.trigger,
                &plan.kind_connections,
                plan.max_cache_size_mb,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(plugin = %plan.plugin, pid, error = %e, "initial connection config failed");
                if let Err(kill_err) = process.kill() {
                    tracing::warn!(plugin = %plan.plugin, pid, error = %kill_err, "failed to kill plugin process");
                }
                return Err(SupervisorError::launch(&plan.plugin, e));
            }
        };

        for (connection, reason) in &outcome.failed {
            tracing::warn!(plugin = %plan.plugin, connection = %connection, reason = %reason, "plugin rejected connection");
        }

        let reattach = ReattachInfo::new(&plan.plugin, pid, &handshake, ops, outcome.served);

        if ops.message_stream {
            match self
                .listener
                .start(&plan.plugin, client.clone(), &reattach.connections)
                .await
            {
                ListenerOutcome::Failed(reason) => {
                    tracing::warn!(plugin = %plan.plugin, reason = %reason, "message listener not started");
                }
                outcome => tracing::debug!(plugin = %plan.plugin, ?outcome, "message listener"),
            }
        }

        tracing::info!(
            plugin = %plan.plugin,
            pid,
            multiplexing = protocol.supports_multiplexing(),
            connections = reattach.connections.len(),
            "plugin ready"
        );

        Ok(LaunchedWorker {
            process,
            client,
            protocol,
            reattach,
        })
    }
}
