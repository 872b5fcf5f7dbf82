//! Process-level RPC facade.
//!
//! Exposes a [`Supervisor`] to other processes over the same NDJSON-over-TCP
//! envelopes plugins use. Each request is handled on its own task, so a
//! slow plugin start does not block other callers on the same connection.

mod client;

pub use client::SupervisorClient;

use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfigMap;
use crate::supervisor::{Supervisor, SupervisorError};
use crate::worker::protocol::{codes, RequestEnvelope, ResponseEnvelope};
use crate::worker::Handshake;

/// Facade method names.
pub mod methods {
    pub const GET: &str = "supervisor.get";
    pub const SET_CONNECTION_CONFIGS: &str = "supervisor.set_connection_configs";
    pub const SHUTDOWN: &str = "supervisor.shutdown";
}

/// Parameters for `supervisor.get`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetRequest {
    pub connections: Vec<String>,
}

/// Parameters for `supervisor.set_connection_configs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetConnectionConfigsParams {
    pub connections: ConnectionConfigMap,
}

/// Result of `supervisor.shutdown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownResponse {
    /// Plugin processes signalled.
    pub killed: usize,
}

/// TCP server for the supervisor facade.
pub struct SupervisorServer {
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
}

impl SupervisorServer {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind a listener and build the handshake announcing it.
    pub async fn bind(addr: &str) -> io::Result<(TcpListener, Handshake)> {
        let listener = TcpListener::bind(addr).await?;
        let handshake = Handshake::new(listener.local_addr()?.to_string());
        Ok((listener, handshake))
    }

    /// Cancelled once `supervisor.shutdown` has been served.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown is requested.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            tracing::debug!(%peer, "facade client connected");
            tokio::spawn(handle_connection(
                stream,
                self.supervisor.clone(),
                self.shutdown.clone(),
            ));
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(write_half));
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = reader.read_line(&mut line) => read,
        };
        match read {
            Ok(0) => return,
            Ok(_) if line.trim().is_empty() => continue,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "facade connection read error");
                return;
            }
        }

        let request = match serde_json::from_str::<RequestEnvelope>(&line) {
            Ok(request) => request,
            Err(e) => {
                let response = ResponseEnvelope::err("", codes::INVALID_REQUEST, e.to_string());
                if write_response(&writer, &response).await.is_err() {
                    return;
                }
                continue;
            }
        };

        let supervisor = supervisor.clone();
        let shutdown = shutdown.clone();
        let writer = writer.clone();
        tokio::spawn(async move {
            let is_shutdown = request.method == methods::SHUTDOWN;
            let response = dispatch(&supervisor, request).await;
            if let Err(e) = write_response(&writer, &response).await {
                tracing::debug!(error = %e, "failed to write facade response");
            }
            if is_shutdown && response.success {
                shutdown.cancel();
            }
        });
    }
}

async fn write_response(
    writer: &Mutex<OwnedWriteHalf>,
    response: &ResponseEnvelope,
) -> io::Result<()> {
    let line = serde_json::to_string(response)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        + "\n";
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Handle one facade request.
pub async fn dispatch(supervisor: &Supervisor, request: RequestEnvelope) -> ResponseEnvelope {
    let RequestEnvelope { id, method, params } = request;

    let result = match method.as_str() {
        methods::GET => match decode::<GetRequest>(params) {
            Ok(params) => supervisor
                .get(&params.connections)
                .await
                .and_then(|response| to_value(&response)),
            Err(message) => return ResponseEnvelope::err(id, codes::INVALID_REQUEST, message),
        },
        methods::SET_CONNECTION_CONFIGS => match decode::<SetConnectionConfigsParams>(params) {
            Ok(params) => supervisor
                .set_connection_config_map(params.connections)
                .await
                .map(|()| serde_json::json!({})),
            Err(message) => return ResponseEnvelope::err(id, codes::INVALID_REQUEST, message),
        },
        methods::SHUTDOWN => supervisor
            .shutdown()
            .and_then(|killed| to_value(&ShutdownResponse { killed })),
        other => {
            return ResponseEnvelope::err(
                id,
                codes::METHOD_NOT_FOUND,
                format!("unknown method '{}'", other),
            )
        }
    };

    match result {
        Ok(value) => ResponseEnvelope::ok(id, value),
        Err(e) => {
            let code = if e.is_config_error() {
                codes::INVALID_REQUEST
            } else {
                codes::INTERNAL
            };
            ResponseEnvelope::err(id, code, e.to_string())
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(params: serde_json::Value) -> Result<T, String> {
    serde_json::from_value(params).map_err(|e| format!("invalid params: {}", e))
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, SupervisorError> {
    serde_json::to_value(value).map_err(|e| SupervisorError::Internal(e.to_string()))
}
