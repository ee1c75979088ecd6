//! Bulk ingest daemon
//!
//! Runs the dispatcher, local workers and maintenance tasks until Ctrl-C.
//!
//! Run with: cargo run -p bulk-ingest --bin bulk-ingest-daemon -- --config ingest.toml

use bulk_ingest::{IngestConfig, IngestService};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "bulk-ingest-daemon", version, about = "Bulk upload orchestration daemon")]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the number of local workers
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bulk_ingest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => IngestConfig::from_file(path)?,
        None => IngestConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.workers.local_workers = workers;
    }

    tracing::info!("Configuration loaded");
    tracing::info!("  - Database: {}", config.storage.database_path.display());
    tracing::info!("  - Objects: {}", config.storage.objects_dir.display());
    tracing::info!("  - Local workers: {}", config.workers.local_workers);
    tracing::info!("  - Parallel files: {}", config.batch.parallel_files());
    tracing::info!("  - Rate limiting: {}", config.rate_limit.enabled);

    let service = IngestService::new(config)?;
    service.start()?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    service.shutdown().await;

    Ok(())
}
