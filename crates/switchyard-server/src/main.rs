//! Switchyard service binary.
//!
//! Serves a service's declared input queues, issues one-off calls as that
//! service, and prints its resolved routes.

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::call::CallArgs;
use config::AppConfig;

/// Broker-mediated RPC service.
#[derive(Parser, Debug)]
#[command(name = "switchyard")]
#[command(about = "Serve, call and inspect broker-mediated RPC routes")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume this service's input queues until Ctrl+C or SIGTERM
    Serve,

    /// Send one message as this service and print the reply
    Call {
        /// Message code to send
        code: String,

        /// JSON payload (defaults to {})
        payload: Option<String>,

        /// Message header, repeatable
        #[arg(short = 'H', long = "header", value_name = "KEY=VALUE", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Reply deadline in seconds
        #[arg(short, long, value_name = "SECS")]
        timeout: Option<f64>,
    },

    /// Print the routes this service sends on and the queues it consumes
    Routes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug,lapin=info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::load(cli.config.as_deref())?;
    info!(
        backend = config.broker.backend_name(),
        topology_dir = %config.topology.dir.display(),
        deployment = config.topology.deployment_code.as_deref().unwrap_or("<unset>"),
        service = config.topology.service_code.as_deref().unwrap_or("<unset>"),
        "configuration loaded"
    );

    match cli.command {
        Command::Serve => commands::serve::run(config, shutdown_signal()).await,
        Command::Call {
            code,
            payload,
            headers,
            timeout,
        } => {
            let args = CallArgs {
                code,
                payload,
                headers,
                timeout,
            };
            commands::call::run(config, args).await
        }
        Command::Routes => commands::routes::run(&config),
    }
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("header name is empty in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
