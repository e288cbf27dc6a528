//! Hydrant - streaming bulk ingestion into PostgreSQL
//!
//! Usage:
//!   # Read stdin, configure from HYDRANT_DB_URL / HYDRANT_BATCH_SIZE
//!   hydrant
//!
//!   # Configure from a YAML file
//!   hydrant hydrant.yml
//!
//!   # Ingest a file
//!   hydrant hydrant.yml dump.bin

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncRead;
use tracing::{error, info};

use hydrant::{Cli, Hydrant};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    hydrant::logging::init(&cli.log_level);

    let pipeline = Hydrant::init(cli.config.as_deref())
        .await
        .context("failed to initialize hydrant")?;

    match &cli.input {
        Some(path) => {
            let file = match tokio::fs::File::open(path).await {
                Ok(file) => file,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "unable to open input file");
                    pipeline.request_shutdown().await;
                    anyhow::bail!("unable to open input file {}: {e}", path.display());
                }
            };
            info!(path = %path.display(), "processing input from file");
            run(&pipeline, file).await;
        }
        None => {
            info!("processing input from stdin until EOF");
            run(&pipeline, tokio::io::stdin()).await;
        }
    }

    pipeline.request_shutdown().await;
    info!("hydrant shutdown complete");
    Ok(())
}

/// Drive the producer loop, racing it against a shutdown signal so an
/// interrupted run still flushes its residual batch.
async fn run<R>(pipeline: &Hydrant, input: R)
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        _ = pipeline.process_input(input) => {}
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
