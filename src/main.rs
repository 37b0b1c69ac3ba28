use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use remediation_governor::{
    config::{Config, FixStoreKind, LogFormat},
    server::StopReason,
    CommandGateway, DefaultContextFactory,
};

/// Remediation governor: line-delimited JSON commands on stdin/stdout.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Fix memory backend (sqlite or json)
    #[arg(long)]
    backend: Option<FixStoreKind>,

    /// Log file to follow; repeat for several files
    #[arg(long = "log-file")]
    log_files: Vec<PathBuf>,

    /// JSON status file of the governed process
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// SQLite database path
    #[arg(long)]
    database: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(backend) = self.backend {
            config.memory.backend = backend;
        }
        if !self.log_files.is_empty() {
            config.monitor.log_files = self.log_files;
        }
        if let Some(path) = self.status_file {
            config.monitor.status_file = Some(path);
        }
        if let Some(path) = self.database {
            config.database.path = path;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    args.apply(&mut config);

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.memory.backend,
        "Remediation governor starting..."
    );

    let gateway = CommandGateway::new(
        Arc::new(DefaultContextFactory::new(config.clone())),
        config.gateway.clone(),
    );

    tokio::select! {
        result = gateway.run(tokio::io::stdin(), tokio::io::stdout()) => {
            match result {
                Ok(StopReason::Shutdown) => info!("Shutdown requested"),
                Ok(StopReason::EndOfInput) => info!("EOF received, shutting down"),
                Err(e) => {
                    error!(error = %e, "Gateway error");
                    gateway.shutdown().await;
                    return Err(e.into());
                }
            }
        }
        _ = shutdown_signal() => {
            info!("Termination signal received");
            gateway.shutdown().await;
        }
    }

    info!("Governor shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Initialize tracing/logging. Stdout carries the protocol, so logs go to stderr.
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
