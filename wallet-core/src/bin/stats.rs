//! Ledger statistics binary
//!
//! Opens the RocksDB-backed ledger and prints platform statistics as JSON.
//! Configuration comes from the TOML file given as the first argument, or
//! from `WALLET_*` environment variables otherwise.

use anyhow::Context;
use wallet_core::{Config, WalletLedger};

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => Config::from_env().context("failed to load config from environment")?,
    };
    let admin_api_key = config.admin_api_key.clone();

    let span = tracing::info_span!("service", name = %config.service_name);
    let _entered = span.enter();

    tracing::info!(data_dir = %config.data_dir.display(), "Opening wallet ledger");
    let ledger = WalletLedger::open(config).context("failed to open ledger")?;

    let stats = ledger.get_statistics(&admin_api_key)?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}
