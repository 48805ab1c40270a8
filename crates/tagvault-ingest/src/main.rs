#![warn(missing_docs)]

//! `tv-ingest`: ingest files into a TagVault catalog and maintain it.

use anyhow::Result;
use clap::Parser;
use tagvault_ingest::cli::Cli;
use tagvault_ingest::LogConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    init_tracing(&config.log);

    tracing::debug!(data_dir = %config.data_dir.display(), "tv-ingest starting");
    cli.run(config).await
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let registry = tracing_subscriber::registry().with(filter);
    if log.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
