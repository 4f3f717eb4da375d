//! bmslink - BMS monitor entry point
//!
//! Runs the broker link as a long-lived monitor with an HTTP health surface,
//! sends one-off commands, or validates configuration.

use bmslink::config::MonitorConfig;
use bmslink::monitor::BmsMonitor;
use bmslink::observability::{health::HealthServer, init_default_logging};
use bmslink::protocol::BmsCommand;
use bmslink::state::Severity;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

/// Resilient MQTT link to a battery management system
#[derive(Parser)]
#[command(name = "bmslink")]
#[command(about = "Monitor and control a BMS over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BMSLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep the link up and serve health endpoints until interrupted
    Run {
        /// Port for the HTTP health server
        #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
        health_port: u16,
    },
    /// Connect, send one command and exit
    Send {
        /// charge_enable, discharge_enable or reset_bms
        command: BmsCommand,

        /// Value to send; defaults to true
        #[arg(long)]
        value: Option<bool>,

        /// How long to wait for the broker before giving up
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting bmslink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { health_port } => run_monitor(config, health_port).await,
        Commands::Send {
            command,
            value,
            wait_secs,
        } => send_command(config, command, value, Duration::from_secs(wait_secs)).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<MonitorConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(MonitorConfig::load_from_file(path)?);
    }

    for path_str in ["bmslink.toml", "config/bmslink.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(MonitorConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create bmslink.toml".into())
}

async fn run_monitor(
    config: MonitorConfig,
    health_port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut monitor = BmsMonitor::new(&config)?;

    let health_server = Arc::new(HealthServer::new(
        health_port,
        monitor.state().clone(),
        config.telemetry.stale_after(),
    ));
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.start().await {
            error!("Health server error: {}", e);
        }
    });

    let mut notifications = monitor.notifications();
    monitor.start();

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(endpoints = config.broker.endpoints.len(), "Monitor running");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            notification = notifications.recv() => match notification {
                Ok(n) => match n.severity {
                    Severity::Info => info!(title = %n.title, "{}", n.description),
                    Severity::Error => warn!(title = %n.title, "{}", n.description),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Notification listener fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    monitor.shutdown().await;
    health_task.abort();
    Ok(())
}

async fn send_command(
    config: MonitorConfig,
    command: BmsCommand,
    value: Option<bool>,
    wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut monitor = BmsMonitor::new(&config)?;
    let mut status = monitor.watch_status();
    monitor.start();

    let connected = timeout(wait, async {
        while !status.borrow_and_update().is_connected {
            if status.changed().await.is_err() {
                return false;
            }
        }
        true
    })
    .await
    .unwrap_or(false);

    if !connected {
        let last_error = monitor.connection_status().last_error;
        monitor.shutdown().await;
        return Err(format!(
            "Could not reach a broker within {}s (last error: {})",
            wait.as_secs(),
            last_error.as_deref().unwrap_or("none")
        )
        .into());
    }

    let sent = monitor.send(command, value);
    // Give the event loop a moment to flush the QoS 0 publish
    tokio::time::sleep(Duration::from_millis(250)).await;
    monitor.shutdown().await;

    if sent {
        println!("Sent {command} = {}", value.unwrap_or(true));
        Ok(())
    } else {
        Err(format!("Command {command} was not sent").into())
    }
}

fn handle_config_command(
    config: MonitorConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!(
        endpoints = config.broker.endpoints.len(),
        credentials = config.credentials().is_some(),
        "Configuration validation complete"
    );
    Ok(())
}
