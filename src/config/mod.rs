//! Configuration module for Conduit.
//!
//! Handles plugin and connection configuration, environment variables, and settings.

mod connection;
mod settings;

pub use connection::{short_name, ConnectionConfigMap, LogicalConnection};
pub use settings::{
    expand_env_vars, parse_duration, ConnectionSettings, LogSettings, PluginSettings, Settings,
    SettingsError, SupervisorSettings,
};
