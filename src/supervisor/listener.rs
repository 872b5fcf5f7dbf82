//! Out-of-band plugin notifications.
//!
//! Workers that declare `message_stream` get one stream per served
//! connection. Each stream is drained by its own task until the stream ends,
//! the worker turns out not to implement streams, or the supervisor shuts
//! down. Receive errors never end a stream; a long run of them only slows
//! the loop down. Schema updates are forwarded to a [`ConnectionRefresher`]
//! without blocking the stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::worker::protocol::{PluginMessage, PluginMessageType};
use crate::worker::{MessageStream, PluginClient};

/// Consecutive receive errors tolerated before the loop starts backing off.
const BACKOFF_AFTER_ERRORS: u32 = 16;
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Delay before the next receive after `consecutive_errors` failures in a row.
fn backoff(consecutive_errors: u32) -> Option<Duration> {
    let over = consecutive_errors.checked_sub(BACKOFF_AFTER_ERRORS)?;
    Some(
        INITIAL_BACKOFF
            .saturating_mul(1 << over.min(7))
            .min(MAX_BACKOFF),
    )
}

/// Reacts to schema change notifications.
#[async_trait]
pub trait ConnectionRefresher: Send + Sync {
    /// Reload the schema of `connection`.
    async fn refresh_connection_schema(&self, connection: &str);
}

/// Refresher that only logs. Used when no schema cache is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingRefresher;

#[async_trait]
impl ConnectionRefresher for LoggingRefresher {
    async fn refresh_connection_schema(&self, connection: &str) {
        tracing::info!(connection, "schema updated");
    }
}

/// Result of starting listeners for a worker. Informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerOutcome {
    /// Streams opened; `failed` connections could not be opened.
    Started { streams: usize, failed: usize },
    /// The worker does not implement message streams.
    NotSupported,
    /// No stream could be opened.
    Failed(String),
}

/// Starts and owns listener tasks.
#[derive(Clone)]
pub struct NotificationListener {
    refresher: Arc<dyn ConnectionRefresher>,
    cancel: CancellationToken,
}

impl NotificationListener {
    pub fn new(refresher: Arc<dyn ConnectionRefresher>, cancel: CancellationToken) -> Self {
        Self { refresher, cancel }
    }

    /// Open a stream for each of `connections` and spawn its receive loop.
    pub async fn start(
        &self,
        plugin: &str,
        client: Arc<dyn PluginClient>,
        connections: &[String],
    ) -> ListenerOutcome {
        let mut streams = 0;
        let mut last_error = None;

        for connection in connections {
            match client.establish_message_stream(connection).await {
                Ok(stream) => {
                    streams += 1;
                    tokio::spawn(run(
                        plugin.to_string(),
                        connection.clone(),
                        stream,
                        self.refresher.clone(),
                        self.cancel.clone(),
                    ));
                }
                Err(e) if e.is_not_implemented() => {
                    tracing::debug!(plugin, "plugin does not implement message streams");
                    return ListenerOutcome::NotSupported;
                }
                Err(e) => {
                    tracing::warn!(plugin, connection = %connection, error = %e, "failed to open message stream");
                    last_error = Some(e.to_string());
                }
            }
        }

        match last_error {
            Some(reason) if streams == 0 => ListenerOutcome::Failed(reason),
            _ => ListenerOutcome::Started {
                streams,
                failed: connections.len() - streams,
            },
        }
    }
}

async fn run(
    plugin: String,
    connection: String,
    mut stream: Box<dyn MessageStream>,
    refresher: Arc<dyn ConnectionRefresher>,
    cancel: CancellationToken,
) {
    let mut consecutive_errors: u32 = 0;

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = stream.recv() => received,
        };

        match received {
            Ok(message) => {
                consecutive_errors = 0;
                dispatch(&plugin, &connection, message, &refresher, &cancel);
            }
            Err(e) if e.is_end_of_stream() => {
                tracing::debug!(plugin = %plugin, connection = %connection, "message stream closed");
                return;
            }
            Err(e) if e.is_not_implemented() => {
                tracing::debug!(plugin = %plugin, "plugin does not implement message streams");
                return;
            }
            Err(e) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                tracing::error!(plugin = %plugin, connection = %connection, error = %e, "error receiving plugin message");
                if let Some(delay) = backoff(consecutive_errors) {
                    tracing::debug!(plugin = %plugin, connection = %connection, errors = consecutive_errors, delay_ms = delay.as_millis() as u64, "backing off message stream");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

fn dispatch(
    plugin: &str,
    stream_connection: &str,
    message: PluginMessage,
    refresher: &Arc<dyn ConnectionRefresher>,
    cancel: &CancellationToken,
) {
    let connection = if message.connection.is_empty() {
        stream_connection.to_string()
    } else {
        message.connection
    };

    match message.message_type {
        PluginMessageType::SchemaUpdated => {
            tracing::debug!(plugin, connection = %connection, "schema update notification");
            let refresher = refresher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = refresher.refresh_connection_schema(&connection) => {}
                }
            });
        }
        PluginMessageType::Unknown => {
            tracing::warn!(plugin, connection = %connection, "unknown plugin message type");
        }
    }
}
