//! Client for a running supervisor's facade.

use std::time::Duration;

use super::{methods, GetRequest, SetConnectionConfigsParams, ShutdownResponse};
use crate::config::ConnectionConfigMap;
use crate::supervisor::{GetResponse, SupervisorState};
use crate::worker::{WorkerClient, WorkerResult};

/// Typed wrapper over a [`WorkerClient`] connected to `conduit serve`.
pub struct SupervisorClient {
    inner: WorkerClient,
}

impl SupervisorClient {
    pub async fn connect(address: &str, timeout: Duration) -> WorkerResult<Self> {
        Ok(Self {
            inner: WorkerClient::connect_with_timeout(address, timeout).await?,
        })
    }

    /// Connect to the supervisor recorded in a state file.
    pub async fn reattach(state: &SupervisorState, timeout: Duration) -> WorkerResult<Self> {
        Self::connect(&state.address, timeout).await
    }

    pub async fn get(&self, connections: Vec<String>) -> WorkerResult<GetResponse> {
        self.inner
            .request(methods::GET, GetRequest { connections })
            .await
    }

    pub async fn set_connection_configs(&self, connections: ConnectionConfigMap) -> WorkerResult<()> {
        let _: serde_json::Value = self
            .inner
            .request(
                methods::SET_CONNECTION_CONFIGS,
                SetConnectionConfigsParams { connections },
            )
            .await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> WorkerResult<ShutdownResponse> {
        self.inner.request(methods::SHUTDOWN, serde_json::json!({})).await
    }
}
