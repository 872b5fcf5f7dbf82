//! Logical connection configuration.
//!
//! A logical connection is a named configuration routed to one plugin worker.
//! Connections are immutable once received and replaced wholesale when the
//! configuration changes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Desired configuration, keyed by connection name.
pub type ConnectionConfigMap = HashMap<String, LogicalConnection>;

/// A named connection served by a plugin worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalConnection {
    /// Connection name.
    pub name: String,

    /// Worker kind (plugin) that serves this connection.
    pub plugin: String,

    /// Short plugin name used in schema names and log lines.
    #[serde(default)]
    pub plugin_short_name: String,

    /// Opaque config payload, passed to the worker untouched.
    #[serde(default)]
    pub config: String,

    /// Optional short alias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Child connections of an aggregator.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_connections: Vec<String>,
}

impl LogicalConnection {
    /// Create a connection with an opaque config payload.
    pub fn new(
        name: impl Into<String>,
        plugin: impl Into<String>,
        config: impl Into<String>,
    ) -> Self {
        let plugin = plugin.into();
        Self {
            name: name.into(),
            plugin_short_name: short_name(&plugin),
            plugin,
            config: config.into(),
            alias: None,
            child_connections: Vec::new(),
        }
    }

    /// Create an aggregator over the given child connections.
    pub fn aggregator(
        name: impl Into<String>,
        plugin: impl Into<String>,
        children: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut conn = Self::new(name, plugin, "");
        conn.child_connections = children.into_iter().map(Into::into).collect();
        conn
    }

    /// Set the alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Aggregators have no independent data of their own.
    pub fn is_aggregator(&self) -> bool {
        !self.child_connections.is_empty()
    }

    /// Whether the worker would see a different connection.
    ///
    /// The alias is local bookkeeping and does not count.
    pub fn content_differs(&self, other: &LogicalConnection) -> bool {
        self.plugin != other.plugin
            || self.config != other.config
            || self.child_connections != other.child_connections
    }
}

/// Derive a short name from a plugin reference such as
/// `hub.example.com/plugins/acme/aws@latest`.
pub fn short_name(plugin: &str) -> String {
    let without_version = plugin.split('@').next().unwrap_or(plugin);
    without_version
        .rsplit('/')
        .next()
        .unwrap_or(without_version)
        .to_string()
}
