//! Wire protocol variants, chosen once per worker at launch.
//!
//! Multiplexing workers take every connection of their kind in one request
//! and accept live diffs. Legacy workers take exactly one connection and must
//! be restarted to see a change.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::LogicalConnection;
use crate::worker::protocol::{
    SetAllConnectionConfigsRequest, SetConnectionConfigRequest, SupportedOperations,
    UpdateConnectionConfigsRequest,
};
use crate::worker::{PluginClient, WorkerError, WorkerResult};

/// Outcome of a config handoff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOutcome {
    /// Connections the worker now serves.
    pub served: Vec<String>,
    /// Connections the worker refused, with the reason.
    pub failed: HashMap<String, String>,
}

/// How configuration reaches a worker.
#[async_trait]
pub trait ConnectionProtocol: Send + Sync {
    /// One process serves every connection of the kind.
    fn supports_multiplexing(&self) -> bool;

    /// Changes can be pushed without a restart.
    fn supports_live_update(&self) -> bool;

    /// Initial config handoff right after the handshake.
    ///
    /// `trigger` is the connection that caused the launch; `kind_connections`
    /// is every connection currently desired for the worker kind.
    async fn apply_initial_config(
        &self,
        client: &dyn PluginClient,
        trigger: &LogicalConnection,
        kind_connections: &[LogicalConnection],
        max_cache_size_mb: u64,
    ) -> WorkerResult<ConfigOutcome>;

    /// Push one batched diff to a running worker.
    async fn apply_live_update(
        &self,
        client: &dyn PluginClient,
        update: UpdateConnectionConfigsRequest,
    ) -> WorkerResult<ConfigOutcome>;
}

/// Select the protocol variant for a worker's declared operations.
pub fn protocol_for(ops: &SupportedOperations) -> Arc<dyn ConnectionProtocol> {
    if ops.multiple_connections {
        Arc::new(MultiConnectionProtocol {
            live_update: ops.live_config_update,
        })
    } else {
        Arc::new(SingleConnectionProtocol)
    }
}

/// Protocol for workers that multiplex connections.
#[derive(Debug, Clone, Copy)]
pub struct MultiConnectionProtocol {
    live_update: bool,
}

#[async_trait]
impl ConnectionProtocol for MultiConnectionProtocol {
    fn supports_multiplexing(&self) -> bool {
        true
    }

    fn supports_live_update(&self) -> bool {
        self.live_update
    }

    async fn apply_initial_config(
        &self,
        client: &dyn PluginClient,
        trigger: &LogicalConnection,
        kind_connections: &[LogicalConnection],
        max_cache_size_mb: u64,
    ) -> WorkerResult<ConfigOutcome> {
        let mut configs = kind_connections.to_vec();
        if !configs.iter().any(|c| c.name == trigger.name) {
            configs.push(trigger.clone());
        }
        let requested: Vec<String> = configs.iter().map(|c| c.name.clone()).collect();

        let response = client
            .set_all_connection_configs(SetAllConnectionConfigsRequest {
                configs,
                max_cache_size_mb,
            })
            .await?;

        if let Some(reason) = response.failed_connections.get(&trigger.name) {
            return Err(WorkerError::ConnectionConfigFailed(format!(
                "{}: {}",
                trigger.name, reason
            )));
        }

        Ok(ConfigOutcome {
            served: requested
                .into_iter()
                .filter(|name| !response.failed_connections.contains_key(name))
                .collect(),
            failed: response.failed_connections,
        })
    }

    async fn apply_live_update(
        &self,
        client: &dyn PluginClient,
        update: UpdateConnectionConfigsRequest,
    ) -> WorkerResult<ConfigOutcome> {
        let added: Vec<String> = update.added.iter().map(|c| c.name.clone()).collect();
        let response = client.update_connection_configs(update).await?;
        Ok(ConfigOutcome {
            served: added
                .into_iter()
                .filter(|name| !response.failed_connections.contains_key(name))
                .collect(),
            failed: response.failed_connections,
        })
    }
}

/// Protocol for legacy single-connection workers.
#[derive(Debug, Clone, Copy)]
pub struct SingleConnectionProtocol;

#[async_trait]
impl ConnectionProtocol for SingleConnectionProtocol {
    fn supports_multiplexing(&self) -> bool {
        false
    }

    fn supports_live_update(&self) -> bool {
        false
    }

    async fn apply_initial_config(
        &self,
        client: &dyn PluginClient,
        trigger: &LogicalConnection,
        _kind_connections: &[LogicalConnection],
        _max_cache_size_mb: u64,
    ) -> WorkerResult<ConfigOutcome> {
        client
            .set_connection_config(SetConnectionConfigRequest {
                connection: trigger.name.clone(),
                config: trigger.config.clone(),
            })
            .await?;
        Ok(ConfigOutcome {
            served: vec![trigger.name.clone()],
            failed: HashMap::new(),
        })
    }

    async fn apply_live_update(
        &self,
        _client: &dyn PluginClient,
        _update: UpdateConnectionConfigsRequest,
    ) -> WorkerResult<ConfigOutcome> {
        Err(WorkerError::NotImplemented(
            "single-connection plugins cannot be updated live".to_string(),
        ))
    }
}
