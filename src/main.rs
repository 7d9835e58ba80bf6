//! Node manager daemon binary
//!
//! Loads the daemon configuration, wires the node manager to its
//! collaborators and runs until a termination signal arrives.

use std::path::PathBuf;
use std::process;

use clap::{Arg, Command};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wifi_node::daemon::{DaemonConfig, WifiDaemon};
use wifi_node::driver::Drivers;
use wifi_node::{Result, WifiError};

const DEFAULT_CONFIG_PATH: &str = "/etc/wifi-node/daemon.toml";
const DEFAULT_LOG_LEVEL: &str = "info";

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("wifi-noded")
        .version(env!("CARGO_PKG_VERSION"))
        .about("802.11 node manager daemon")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .default_value(DEFAULT_LOG_LEVEL),
        )
        .arg(
            Arg::new("ssid")
                .short('s')
                .long("ssid")
                .value_name("SSID")
                .help("Desired network name, overrides the configuration"),
        )
        .arg(
            Arg::new("channel")
                .long("channel")
                .value_name("CHANNEL")
                .help("Pin the operating channel, overrides the configuration"),
        )
        .get_matches();

    let log_level = matches.get_one::<String>("log-level").unwrap();
    init_logging(log_level)?;

    info!("Starting wifi-noded v{}", env!("CARGO_PKG_VERSION"));

    let config_path = PathBuf::from(matches.get_one::<String>("config").unwrap());
    let mut config = load_configuration(&config_path)?;

    if let Some(ssid) = matches.get_one::<String>("ssid") {
        config.wifi.des_ssid = Some(ssid.as_bytes().to_vec());
    }
    if let Some(chan) = matches.get_one::<String>("channel") {
        let chan = chan
            .parse::<u8>()
            .map_err(|_| WifiError::Config(format!("Invalid channel '{}'", chan)))?;
        config.wifi.des_chan = Some(chan);
    }

    let shutdown_signal = setup_signal_handlers();

    let result = run_daemon(config, shutdown_signal).await;
    match result {
        Ok(_) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Daemon error: {}", e);
            process::exit(1);
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| WifiError::Config(format!("Invalid log level '{}': {}", level, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    Ok(())
}

fn load_configuration(config_path: &PathBuf) -> Result<DaemonConfig> {
    if !config_path.exists() {
        warn!(
            "Configuration file not found: {}, using defaults",
            config_path.display()
        );
        return Ok(DaemonConfig::default());
    }
    info!("Loading configuration from: {}", config_path.display());
    DaemonConfig::load_from_file(config_path)
}

fn setup_signal_handlers() -> tokio::sync::oneshot::Receiver<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        let _ = tx.send(());
    });

    rx
}

async fn run_daemon(
    config: DaemonConfig,
    shutdown_signal: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    // No radio backend is wired up yet; every collaborator request is
    // accepted and discarded.
    let mut daemon = WifiDaemon::new(config, Drivers::null())?;

    daemon.start().await?;
    let _ = shutdown_signal.await;

    info!("Shutdown signal received, stopping daemon");
    daemon.stop().await?;
    Ok(())
}
