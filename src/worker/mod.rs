//! Plugin worker communication.
//!
//! Plugins are long-running child processes. This module starts them,
//! completes the reattach handshake and talks to them over NDJSON RPC.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Conduit Supervisor (Rust + Tokio)               │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │  ProcessSpawner                                           │  │
//! │  │  - sha256 of the executable, magic cookie in env          │  │
//! │  │  - reads `1|1|tcp|<addr>|ndjson` from plugin stdout       │  │
//! │  ├───────────────────────────────────────────────────────────┤  │
//! │  │  WorkerClient (PluginClient)                              │  │
//! │  │  - NDJSON envelopes over TCP, request IDs for correlation │  │
//! │  │  - message streams on dedicated connections               │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │ tcp (reattachable by address)
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          Plugin Worker (one or many logical connections)        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use conduit::config::PluginSettings;
//! use conduit::worker::{ProcessSpawner, WorkerSpawner};
//!
//! let spawned = ProcessSpawner::default()
//!     .spawn("aws", &PluginSettings::new("./conduit-plugin-aws"))
//!     .await?;
//! let ops = spawned.client.get_supported_operations().await?;
//! ```

pub mod checksum;
mod client;
mod error;
pub mod handshake;
mod process;
pub mod protocol;
mod stream;

pub use client::{PluginClient, WorkerClient, DEFAULT_TIMEOUT_SECS};
pub use error::{WorkerError, WorkerResult};
pub use handshake::Handshake;
pub use process::{pid_exists, ChildProcess, ProcessSpawner, SpawnedWorker, WorkerProcess, WorkerSpawner};
pub use stream::{MessageStream, TcpMessageStream};
