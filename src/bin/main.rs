//! Conduit CLI - supervise data source plugin processes
//!
//! Usage:
//!   conduit serve [--config <file>]
//!   conduit get <connection>... [--config <file>]
//!   conduit stop [--config <file>]
//!   conduit budget [--config <file>]
//!
//! Examples:
//!   conduit serve --config conduit.toml
//!   conduit get aws_prod gcp_dev
//!   CONDUIT_LOG=debug conduit serve

use clap::{Parser, Subcommand};
use conduit::config::Settings;
use conduit::server::{SupervisorClient, SupervisorServer};
use conduit::supervisor::{
    allocate, connection_counts, LoggingRefresher, Supervisor, SupervisorConfig, SupervisorState,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a `tracing` filter directive.
const LOG_ENV: &str = "CONDUIT_LOG";

#[derive(Parser)]
#[command(name = "conduit")]
#[command(about = "Conduit - supervisor for out-of-process data source plugins")]
#[command(version)]
struct Cli {
    /// Path to the settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a supervisor and serve its RPC facade
    Serve,

    /// Resolve reattach info for connections from a running supervisor
    Get {
        /// Connection names
        #[arg(required = true)]
        connections: Vec<String>,
    },

    /// Shut down a running supervisor
    Stop,

    /// Print the cache budget of each plugin
    Budget,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_ref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&settings.log.level);

    match cli.command {
        Commands::Serve => cmd_serve(settings).await,
        Commands::Get { connections } => cmd_get(settings, connections).await,
        Commands::Stop => cmd_stop(settings).await,
        Commands::Budget => cmd_budget(settings),
    }
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings, conduit::config::SettingsError> {
    match path {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    }
}

/// Log to stderr; stdout carries the handshake and command output.
fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn cmd_serve(settings: Settings) -> ExitCode {
    let state_path = match settings.state_path() {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Error resolving state path: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Ok(Some(existing)) = SupervisorState::load(&state_path) {
        if existing.is_running() && existing.pid != std::process::id() {
            eprintln!(
                "A supervisor is already running (pid {}, address {})",
                existing.pid, existing.address
            );
            return ExitCode::FAILURE;
        }
    }

    let connections = match settings.connection_config_map() {
        Ok(connections) => connections,
        Err(e) => {
            eprintln!("Invalid connection config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let supervisor = match Supervisor::from_settings(&settings, Arc::new(LoggingRefresher)) {
        Ok(supervisor) => Arc::new(supervisor),
        Err(e) => {
            eprintln!("Invalid supervisor settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = supervisor.set_connection_config_map(connections).await {
        eprintln!("Failed to load connections: {}", e);
        return ExitCode::FAILURE;
    }
    if let Ok(snapshot) = supervisor.snapshot() {
        tracing::debug!(plugins = ?snapshot.plugin_connections, budgets = ?snapshot.cache_budgets, "connections loaded");
    }

    let (listener, handshake) = match SupervisorServer::bind("127.0.0.1:0").await {
        Ok(bound) => bound,
        Err(e) => {
            eprintln!("Failed to bind facade: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let state = SupervisorState::current(&handshake);
    if let Err(e) = state.save(&state_path) {
        eprintln!("Failed to write state file: {}", e);
        return ExitCode::FAILURE;
    }
    println!("{}", handshake);
    tracing::info!(address = %handshake.address, state = %state_path.display(), "supervisor listening");

    let server = SupervisorServer::new(supervisor.clone());
    let exit = tokio::select! {
        served = server.serve(listener) => match served {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "facade server failed");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            ExitCode::SUCCESS
        }
    };

    if !supervisor.is_shutting_down() {
        if let Err(e) = supervisor.shutdown() {
            tracing::error!(error = %e, "shutdown failed");
        }
    }
    if let Err(e) = SupervisorState::delete(&state_path) {
        tracing::warn!(error = %e, "failed to remove state file");
    }
    exit
}

async fn connect(settings: &Settings) -> Result<SupervisorClient, String> {
    let state_path = settings.state_path().map_err(|e| e.to_string())?;
    let state = SupervisorState::load(&state_path)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("no supervisor state at {}", state_path.display()))?;
    if !state.is_running() {
        return Err(format!("supervisor (pid {}) is not running", state.pid));
    }

    let config = SupervisorConfig::from_settings(&settings.supervisor).map_err(|e| e.to_string())?;
    SupervisorClient::reattach(&state, config.request_timeout)
        .await
        .map_err(|e| e.to_string())
}

async fn cmd_get(settings: Settings, connections: Vec<String>) -> ExitCode {
    let client = match connect(&settings).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Cannot reach supervisor: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match client.get(connections).await {
        Ok(response) => match serde_json::to_string_pretty(&response) {
            Ok(json) => {
                println!("{}", json);
                if response.failure_map.is_empty() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                }
            }
            Err(e) => {
                eprintln!("Error encoding response: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Get failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_stop(settings: Settings) -> ExitCode {
    let client = match connect(&settings).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Cannot reach supervisor: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match client.shutdown().await {
        Ok(response) => {
            println!("Stopped supervisor ({} plugin processes killed)", response.killed);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Stop failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_budget(settings: Settings) -> ExitCode {
    let connections = match settings.connection_config_map() {
        Ok(connections) => connections,
        Err(e) => {
            eprintln!("Invalid connection config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let config = match SupervisorConfig::from_settings(&settings.supervisor) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid supervisor settings: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let counts = connection_counts(connections.values());
    let budget: BTreeMap<_, _> = allocate(config.max_cache_size_mb, &counts)
        .into_iter()
        .collect();

    if config.max_cache_size_mb == 0 {
        println!("Cache budget: unlimited");
    } else {
        println!("Cache budget: {} MB", config.max_cache_size_mb);
    }
    for (plugin, mb) in budget {
        let count = counts.get(&plugin).copied().unwrap_or(0);
        println!("  {:<20} {:>6} MB  ({} connections)", plugin, mb, count);
    }
    ExitCode::SUCCESS
}
