//! Out-of-band message streams from plugin workers.
//!
//! A stream is a dedicated connection: the host sends one
//! `plugin.establish_message_stream` request, the worker acknowledges with a
//! response envelope, and every further line is a [`PluginMessage`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::client::decode_response;
use super::error::{WorkerError, WorkerResult};
use super::protocol::{
    methods, EstablishMessageStreamParams, PluginMessage, RequestEnvelope, ResponseEnvelope,
};

/// Receiving side of a worker message stream.
#[async_trait]
pub trait MessageStream: Send {
    /// Block until the next message arrives.
    ///
    /// Returns [`WorkerError::StreamClosed`] once the worker hangs up.
    async fn recv(&mut self) -> WorkerResult<PluginMessage>;
}

/// Message stream over its own TCP connection.
pub struct TcpMessageStream {
    lines: Lines<BufReader<OwnedReadHalf>>,
    // Held so the worker does not see the stream half-closed.
    _writer: OwnedWriteHalf,
}

impl TcpMessageStream {
    /// Connect to `address` and request a stream for `connection`.
    pub async fn open(address: &str, connection: &str, timeout: Duration) -> WorkerResult<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| WorkerError::ConnectFailed {
                addr: address.to_string(),
                source,
            })?;
        let (read_half, mut write_half) = stream.into_split();

        let request = RequestEnvelope {
            id: uuid::Uuid::new_v4().to_string(),
            method: methods::ESTABLISH_MESSAGE_STREAM.to_string(),
            params: serde_json::to_value(EstablishMessageStreamParams {
                connection: connection.to_string(),
            })
            .map_err(WorkerError::SerializeFailed)?,
        };
        let line = serde_json::to_string(&request).map_err(WorkerError::SerializeFailed)? + "\n";
        write_half
            .write_all(line.as_bytes())
            .await
            .map_err(WorkerError::WriteFailed)?;
        write_half.flush().await.map_err(WorkerError::WriteFailed)?;

        let mut lines = BufReader::new(read_half).lines();
        let ack = match tokio::time::timeout(timeout, lines.next_line()).await {
            Ok(Ok(Some(ack))) => ack,
            Ok(Ok(None)) => return Err(WorkerError::StreamClosed),
            Ok(Err(e)) => return Err(WorkerError::ReadFailed(e)),
            Err(_) => return Err(WorkerError::Timeout(timeout.as_secs())),
        };
        let ack: ResponseEnvelope = serde_json::from_str(&ack)?;
        let _: serde_json::Value = decode_response(ack)?;

        Ok(Self {
            lines,
            _writer: write_half,
        })
    }
}

#[async_trait]
impl MessageStream for TcpMessageStream {
    async fn recv(&mut self) -> WorkerResult<PluginMessage> {
        match self.lines.next_line().await {
            Ok(Some(line)) => Ok(serde_json::from_str(&line)?),
            Ok(None) => Err(WorkerError::StreamClosed),
            Err(e) => Err(WorkerError::ReadFailed(e)),
        }
    }
}
