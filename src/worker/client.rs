//! Async RPC client for a running plugin worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};

use super::error::{WorkerError, WorkerResult};
use super::protocol::{
    codes, methods, ErrorInfo, RequestEnvelope, ResponseEnvelope, SetAllConnectionConfigsRequest,
    SetConnectionConfigRequest, SetConnectionConfigsResponse, SupportedOperations,
    UpdateConnectionConfigsRequest,
};
use super::stream::{MessageStream, TcpMessageStream};

/// Default timeout for requests (30 seconds).
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<ResponseEnvelope>>>>;

/// Calls the supervisor makes on a plugin worker.
///
/// Implemented by [`WorkerClient`] for real processes; tests substitute
/// in-memory workers.
#[async_trait]
pub trait PluginClient: Send + Sync {
    /// Query the optional operations this worker supports.
    async fn get_supported_operations(&self) -> WorkerResult<SupportedOperations>;

    /// Hand every connection of the worker kind to a multiplexing worker.
    async fn set_all_connection_configs(
        &self,
        request: SetAllConnectionConfigsRequest,
    ) -> WorkerResult<SetConnectionConfigsResponse>;

    /// Hand the single connection to a legacy worker.
    async fn set_connection_config(&self, request: SetConnectionConfigRequest)
        -> WorkerResult<()>;

    /// Apply a batch of added/deleted/changed connections to a running worker.
    async fn update_connection_configs(
        &self,
        request: UpdateConnectionConfigsRequest,
    ) -> WorkerResult<SetConnectionConfigsResponse>;

    /// Open a duplex message stream for one connection.
    async fn establish_message_stream(
        &self,
        connection: &str,
    ) -> WorkerResult<Box<dyn MessageStream>>;
}

/// NDJSON-over-TCP client for a plugin worker.
///
/// Each request has a unique ID for correlation with responses, so
/// concurrent requests share one connection.
pub struct WorkerClient {
    /// Address from the plugin handshake.
    address: String,

    /// Writer for sending requests.
    writer: Arc<Mutex<BufWriter<OwnedWriteHalf>>>,

    /// Map of pending request IDs to response channels.
    pending: PendingMap,

    /// Handle to the background reader task.
    reader_task: tokio::task::JoinHandle<()>,

    /// Request timeout duration.
    timeout: Duration,
}

impl WorkerClient {
    /// Connect to a worker listening at `address`.
    pub async fn connect(address: &str) -> WorkerResult<Self> {
        Self::connect_with_timeout(address, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect with a custom request timeout.
    pub async fn connect_with_timeout(address: &str, timeout: Duration) -> WorkerResult<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| WorkerError::ConnectFailed {
                addr: address.to_string(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_task = Self::spawn_reader_task(read_half, pending.clone());

        Ok(Self {
            address: address.to_string(),
            writer: Arc::new(Mutex::new(BufWriter::new(write_half))),
            pending,
            reader_task,
            timeout,
        })
    }

    /// Spawn the background task that reads responses from the worker.
    fn spawn_reader_task(
        read_half: OwnedReadHalf,
        pending: PendingMap,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => match serde_json::from_str::<ResponseEnvelope>(&line) {
                        Ok(resp) => {
                            let mut pending = pending.lock().await;
                            if let Some(tx) = pending.remove(&resp.id) {
                                let _ = tx.send(resp);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to parse plugin response");
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "plugin connection read error");
                        break;
                    }
                }
            }

            // Connection gone - fail every pending request
            let mut pending = pending.lock().await;
            for (id, tx) in pending.drain() {
                let _ = tx.send(ResponseEnvelope::err(
                    id,
                    codes::WORKER_EXITED,
                    "plugin connection closed",
                ));
            }
        })
    }

    /// Send a request to the worker and wait for a response.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Serialization fails
    /// - Writing to the worker fails
    /// - The request times out
    /// - The worker returns an error response
    /// - Deserialization of the response fails
    pub async fn request<P, R>(&self, method: &str, params: P) -> WorkerResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = uuid::Uuid::new_v4().to_string();

        let request = RequestEnvelope {
            id: id.clone(),
            method: method.to_string(),
            params: serde_json::to_value(params).map_err(WorkerError::SerializeFailed)?,
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id.clone(), tx);
        }

        {
            let mut writer = self.writer.lock().await;
            let line =
                serde_json::to_string(&request).map_err(WorkerError::SerializeFailed)? + "\n";
            writer
                .write_all(line.as_bytes())
                .await
                .map_err(WorkerError::WriteFailed)?;
            writer.flush().await.map_err(WorkerError::WriteFailed)?;
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => return Err(WorkerError::ChannelClosed),
            Err(_) => {
                // Timeout - clean up pending request to prevent memory leak
                let mut pending = self.pending.lock().await;
                pending.remove(&id);
                return Err(WorkerError::Timeout(self.timeout.as_secs()));
            }
        };

        decode_response(response)
    }

    /// Check if the connection to the worker is still open.
    pub fn is_alive(&self) -> bool {
        !self.reader_task.is_finished()
    }

    /// Address this client is connected to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Get the current request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Turn a response envelope into a typed result.
pub(crate) fn decode_response<R: DeserializeOwned>(response: ResponseEnvelope) -> WorkerResult<R> {
    if response.success {
        let result = response.result.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(result).map_err(WorkerError::DeserializeFailed)
    } else {
        let error = response.error.unwrap_or_else(|| ErrorInfo {
            code: "UNKNOWN".to_string(),
            message: "Unknown error".to_string(),
        });
        Err(classify_error(&error.code, &error.message))
    }
}

/// Classify a worker error code into a more specific error type.
pub(crate) fn classify_error(code: &str, message: &str) -> WorkerError {
    match code {
        codes::NOT_IMPLEMENTED => WorkerError::NotImplemented(message.to_string()),
        codes::INVALID_REQUEST => WorkerError::InvalidRequest(message.to_string()),
        codes::METHOD_NOT_FOUND => WorkerError::MethodNotFound(message.to_string()),
        codes::CONNECTION_CONFIG_FAILED => WorkerError::ConnectionConfigFailed(message.to_string()),
        codes::WORKER_EXITED => WorkerError::WorkerExited,
        _ => WorkerError::remote(code, message),
    }
}

#[async_trait]
impl PluginClient for WorkerClient {
    async fn get_supported_operations(&self) -> WorkerResult<SupportedOperations> {
        self.request(methods::GET_SUPPORTED_OPERATIONS, serde_json::json!({}))
            .await
    }

    async fn set_all_connection_configs(
        &self,
        request: SetAllConnectionConfigsRequest,
    ) -> WorkerResult<SetConnectionConfigsResponse> {
        self.request(methods::SET_ALL_CONNECTION_CONFIGS, request)
            .await
    }

    async fn set_connection_config(
        &self,
        request: SetConnectionConfigRequest,
    ) -> WorkerResult<()> {
        let _: serde_json::Value = self.request(methods::SET_CONNECTION_CONFIG, request).await?;
        Ok(())
    }

    async fn update_connection_configs(
        &self,
        request: UpdateConnectionConfigsRequest,
    ) -> WorkerResult<SetConnectionConfigsResponse> {
        self.request(methods::UPDATE_CONNECTION_CONFIGS, request)
            .await
    }

    async fn establish_message_stream(
        &self,
        connection: &str,
    ) -> WorkerResult<Box<dyn MessageStream>> {
        let stream = TcpMessageStream::open(&self.address, connection, self.timeout).await?;
        Ok(Box::new(stream))
    }
}
