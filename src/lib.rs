//! # Conduit
//!
//! Supervisor for out-of-process data source plugins.
//!
//! ## Architecture
//!
//! Each logical connection (`aws_prod`, `gcp_dev`, ...) is served by a plugin
//! process of its worker kind. The supervisor starts plugins lazily, shares
//! one process between connections when the plugin can multiplex, and pushes
//! configuration changes to running plugins without restarting them:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Settings (conduit.toml: plugins, connections)     │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [connection_config_map]
//! ┌─────────────────────────────────────────────────────────┐
//! │          Supervisor (registry, launcher, updater)        │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [spawn + handshake + NDJSON RPC]
//! ┌─────────────────────────────────────────────────────────┐
//! │              Plugin processes (per kind)                 │
//! └─────────────────────────────────────────────────────────┘
//!                          ▲
//!                          │ [reattach info]
//! ┌─────────────────────────────────────────────────────────┐
//! │          Facade server (supervisor.get / shutdown)       │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod server;
pub mod supervisor;
pub mod testing;
pub mod worker;

pub use config::{ConnectionConfigMap, LogicalConnection, Settings};
pub use supervisor::{GetResponse, ReattachInfo, Supervisor, SupervisorConfig, SupervisorError};
