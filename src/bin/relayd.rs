//! notify-relay daemon - broker queue to WebSocket clients
//!
//! Consumes JSON messages from a broker queue and relays them to
//! authenticated WebSocket clients, either to everyone or to one identity.
//!
//! # Usage
//!
//! ```bash
//! # Run in the foreground with defaults / RELAY_* environment
//! relayd
//!
//! # Explicit config file, port and queue
//! relayd run --config relay.toml --listen-port 9000 --queue notifications
//!
//! # Validate configuration and exit
//! relayd check-config --config relay.toml
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relayd::config::RelayConfig;
use relayd::supervisor::Supervisor;

/// notify-relay - broker to WebSocket message relay
#[derive(Parser, Debug)]
#[command(name = "relayd", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay (default)
    Run,
    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[derive(Args, Debug, Clone)]
struct Options {
    /// Path to a TOML config file (default: <config dir>/notify-relay/config.toml)
    #[arg(short, long, global = true, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Port for the WebSocket gateway
    #[arg(long, global = true)]
    listen_port: Option<u16>,

    /// Broker queue to consume
    #[arg(long, global = true)]
    queue: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.options)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_relay(config, cli.options.verbose),
        Command::CheckConfig => {
            println!("Configuration is valid");
            println!("{config:#?}");
            Ok(())
        }
    }
}

fn load_config(options: &Options) -> Result<RelayConfig> {
    let mut config = RelayConfig::load(options.config.as_deref())
        .context("Failed to load configuration")?;

    if let Some(port) = options.listen_port {
        config.gateway.port = port;
    }
    if let Some(queue) = &options.queue {
        config.broker.queue_name = queue.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("relayd={level}").parse()?)
                .add_directive(format!("notify_relay={level}").parse()?)
                .add_directive(format!("relay_core={level}").parse()?)
                .add_directive(format!("relay_protocol={level}").parse()?),
        )
        .init();

    Ok(())
}

#[tokio::main]
async fn run_relay(config: RelayConfig, verbose: bool) -> Result<()> {
    init_logging(verbose)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        queue = %config.broker.queue_name,
        gateway = %config.gateway.listen_addr(),
        "Relay starting"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let supervisor = Supervisor::from_config(&config);
    supervisor
        .setup()
        .await
        .context("Failed to start relay")?;

    let outcome = supervisor.run(shutdown).await;
    supervisor.stop().await;

    outcome.context("Relay terminated")?;
    info!("Relay stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
