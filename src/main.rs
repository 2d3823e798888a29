use anyhow::{Context, Result};
use signal_follower::accounts::{AccountProcessor, BybitAccount, SymbolSpecCache};
use signal_follower::aggregator::SignalAggregator;
use signal_follower::config::{Credentials, WeightConfig};
use signal_follower::driver::CycleDriver;
use signal_follower::engine::ReconciliationEngine;
use signal_follower::signals::{
    AssetMapper, BittensorProcessor, SignalProcessor, TradingViewProcessor,
};
use signal_follower::Settings;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting Signal Follower v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;

    // Startup config is fatal when missing; cycles reload with fallback later
    let weight_config = WeightConfig::load(settings.weight_config_path())
        .context("Initial weight config load failed")?;
    let credentials = Credentials::load(settings.credentials_path())
        .context("Credentials load failed")?;
    let mapper = Arc::new(RwLock::new(
        AssetMapper::load(settings.asset_mapping_path())
            .context("Initial asset mapping load failed")?,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Only sources carrying weight anywhere in the table get a processor
    let active_sources = weight_config.active_sources();
    let mut processors: Vec<Arc<dyn SignalProcessor>> = Vec::new();
    if active_sources.contains(signal_follower::signals::tradingview::SIGNAL_SOURCE) {
        processors.push(Arc::new(TradingViewProcessor::new(
            settings.raw_signals_dir("tradingview"),
            Arc::clone(&mapper),
        )));
    }
    if active_sources.contains(signal_follower::signals::bittensor::SIGNAL_SOURCE) {
        let bittensor = Arc::new(BittensorProcessor::new(
            settings.raw_signals_dir("bittensor"),
            Arc::clone(&mapper),
        ));
        Arc::clone(&bittensor).spawn_refresher(shutdown_rx.clone());
        processors.push(bittensor);
    }
    for source in &active_sources {
        if source != signal_follower::signals::tradingview::SIGNAL_SOURCE
            && source != signal_follower::signals::bittensor::SIGNAL_SOURCE
        {
            warn!(%source, "No processor available for configured source");
        }
    }

    let mut accounts: Vec<Arc<dyn AccountProcessor>> = Vec::new();
    for entry in credentials.entries() {
        match entry.exchange_name.as_str() {
            "bybit" => {
                let account = BybitAccount::new(entry)
                    .with_context(|| format!("Failed to build account {}", entry.account_id()))?;
                info!(account = %entry.account_id(), enabled = entry.enabled, "Account registered");
                accounts.push(Arc::new(account));
            }
            other => warn!(exchange = %other, "Unsupported exchange, account skipped"),
        }
    }
    if accounts.is_empty() {
        anyhow::bail!("No usable accounts in credentials");
    }

    info!(
        sources = processors.len(),
        accounts = accounts.len(),
        symbols = weight_config.entries().len(),
        "Configuration loaded"
    );

    // Flip the shutdown flag on SIGINT/SIGTERM; the cycle finishes the
    // in-flight symbol, commits the cache, and exits
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let aggregator = SignalAggregator::new(processors);
    let engine = Arc::new(ReconciliationEngine::new(
        SymbolSpecCache::new(),
        shutdown_rx.clone(),
    ));
    let mut driver = CycleDriver::new(
        settings,
        weight_config,
        mapper,
        aggregator,
        accounts,
        engine,
        shutdown_rx,
    );
    driver.run().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
