//! `kusion` CLI: preview and apply declared application intents.

#![forbid(unsafe_code)]

use std::process::ExitCode;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::error;

mod options;
mod project;
mod runner;

#[derive(Parser, Debug)]
#[command(name = "kusion", version, about = "Intent-driven infrastructure orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compute and display the changes an apply would make
    Preview(options::PreviewOptions),
    /// Apply the intent to the target runtimes and persist new state
    Apply(options::ApplyOptions),
}

fn init_tracing() {
    let env = std::env::var("KUSION_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUSION_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KUSION_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Preview(opts) => opts.run().await,
        Commands::Apply(opts) => opts.run().await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(options::exit_code_for(&e))
        }
    }
}
