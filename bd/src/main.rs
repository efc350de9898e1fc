//! bindery binary entry point

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use bindery::cli::{Cli, run};
use bindery::extract::PopplerExtractor;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bindery=info")))
        .init();

    let cli = Cli::parse();

    let work_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("bindery")
        .join("pages");
    let extractor = Arc::new(PopplerExtractor::new(work_dir));

    run(cli, extractor).await
}
