//! TOML-based configuration for Conduit.
//!
//! Supports a config file (conduit.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [supervisor]
//! startup_timeout = "5s"
//! max_cache_size_mb = 1024
//!
//! [log]
//! level = "info"
//!
//! [plugins.aws]
//! path = "${HOME}/.conduit/plugins/aws/conduit-plugin-aws"
//! checksum = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
//!
//! [connections.aws_prod]
//! plugin = "aws"
//! config = "regions = [\"us-east-1\"]"
//!
//! [connections.aws_all]
//! plugin = "aws"
//! children = ["aws_prod", "aws_dev"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::connection::{short_name, ConnectionConfigMap, LogicalConnection};

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Plugin not configured: {0}")]
    PluginNotFound(String),

    #[error("Invalid duration format: {0}")]
    InvalidDuration(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Supervisor tuning.
    pub supervisor: SupervisorSettings,

    /// Logging configuration.
    pub log: LogSettings,

    /// Plugin binaries, keyed by worker kind.
    pub plugins: HashMap<String, PluginSettings>,

    /// Logical connections, keyed by connection name.
    pub connections: HashMap<String, ConnectionSettings>,
}

/// Supervisor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// How long to wait for another caller's plugin startup (e.g., "5s").
    pub startup_timeout: String,

    /// How long to wait for a plugin's handshake line.
    pub handshake_timeout: String,

    /// Timeout for a single plugin RPC.
    pub request_timeout: String,

    /// Cap on resolve attempts for one connection within a single `get`.
    pub max_resolve_attempts: u32,

    /// Total cache budget shared by all plugins in MB (0 = unlimited).
    pub max_cache_size_mb: u64,

    /// Where `conduit serve` persists its reattach state.
    pub state_path: Option<String>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout: "5s".to_string(),
            handshake_timeout: "30s".to_string(),
            request_timeout: "30s".to_string(),
            max_resolve_attempts: 3,
            max_cache_size_mb: 0,
            state_path: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default level filter when `CONDUIT_LOG` is unset.
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Plugin binary configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PluginSettings {
    /// Path to the plugin executable (supports ${ENV_VAR} expansion).
    pub path: String,

    /// Short name; derived from the plugin key when absent.
    #[serde(default)]
    pub short_name: Option<String>,

    /// Expected SHA-256 of the executable (lowercase hex).
    #[serde(default)]
    pub checksum: Option<String>,

    /// Extra command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl PluginSettings {
    /// Create settings for a binary path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Get the executable path with environment variables expanded.
    pub fn resolved_path(&self) -> Result<PathBuf, SettingsError> {
        Ok(PathBuf::from(expand_env_vars(&self.path)?))
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionSettings {
    /// Worker kind that serves this connection.
    pub plugin: String,

    /// Opaque config payload (supports ${ENV_VAR} expansion).
    #[serde(default)]
    pub config: String,

    /// Optional short alias.
    #[serde(default)]
    pub alias: Option<String>,

    /// Child connections; makes this an aggregator.
    #[serde(default)]
    pub children: Vec<String>,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `CONDUIT_CONFIG`
    /// 2. `./conduit.toml`
    /// 3. `~/.config/conduit/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("CONDUIT_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("conduit.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("conduit").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// Get a plugin by worker kind.
    pub fn get_plugin(&self, kind: &str) -> Result<&PluginSettings, SettingsError> {
        self.plugins
            .get(kind)
            .ok_or_else(|| SettingsError::PluginNotFound(kind.to_string()))
    }

    /// Build the desired connection set handed to the supervisor.
    pub fn connection_config_map(&self) -> Result<ConnectionConfigMap, SettingsError> {
        let mut map = ConnectionConfigMap::with_capacity(self.connections.len());
        for (name, conn) in &self.connections {
            if conn.plugin.is_empty() {
                return Err(SettingsError::InvalidConfig(format!(
                    "connection '{}' has no plugin",
                    name
                )));
            }
            if conn.children.iter().any(|child| child == name) {
                return Err(SettingsError::InvalidConfig(format!(
                    "aggregator '{}' lists itself as a child",
                    name
                )));
            }

            let plugin_short_name = self
                .plugins
                .get(&conn.plugin)
                .and_then(|p| p.short_name.clone())
                .unwrap_or_else(|| short_name(&conn.plugin));

            map.insert(
                name.clone(),
                LogicalConnection {
                    name: name.clone(),
                    plugin: conn.plugin.clone(),
                    plugin_short_name,
                    config: expand_env_vars(&conn.config)?,
                    alias: conn.alias.clone(),
                    child_connections: conn.children.clone(),
                },
            );
        }
        Ok(map)
    }

    /// Where the supervisor state file lives.
    pub fn state_path(&self) -> Result<PathBuf, SettingsError> {
        if let Some(path) = &self.supervisor.state_path {
            return Ok(PathBuf::from(expand_env_vars(path)?));
        }
        dirs::home_dir()
            .map(|home| {
                home.join(".conduit")
                    .join("internal")
                    .join("supervisor.json")
            })
            .ok_or_else(|| SettingsError::InvalidConfig("cannot determine home directory".into()))
    }
}

/// Parse a duration such as "500ms", "5s", "2m" or "1h".
pub fn parse_duration(s: &str) -> Result<Duration, SettingsError> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| SettingsError::InvalidDuration(s.to_string()))?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| SettingsError::InvalidDuration(s.to_string()))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(SettingsError::InvalidDuration(s.to_string())),
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if !(ch.is_alphanumeric() || ch == '_') {
                    break;
                }
                var_name.push(ch);
                chars.next();
            }
            if var_name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
        }

        let value = env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name))?;
        result.push_str(&value);
    }

    Ok(result)
}
