#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! `deploy-agent` binary: parse flags, load configuration, run the connector
//! until the orchestrator sends `shutdown` or the process is signalled.

use std::process::ExitCode;

use tracing::info;

use deploy_agent::cli::Cli;
use deploy_agent::{Client, Config, Connector, SystemProcessControl};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::parse_args(std::env::args()) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    let config = match Config::load(cli.config.as_deref(), &cli.overrides()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("deploy-agent: configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("deploy-agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        name = %config.client.name,
        work_dir = %config.deploy.work_dir.display(),
        "Client configured"
    );

    let mut client = Client::new(&config, SystemProcessControl);
    let mut connector = Connector::new(&config);

    tokio::select! {
        () = connector.run(&mut client) => info!("Goodbye"),
        () = shutdown_signal() => info!("Exiting"),
    }
    ExitCode::SUCCESS
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
