//! Cycle driver: the blocking loop that runs one reconciliation pass and
//! sleeps.
//!
//! Per cycle, in order: reload the weight table (falling back to the last
//! good copy), reload the asset mapping, snapshot all signal sources, blend
//! targets, read the execution cache, fan accounts out, and flush the cache
//! once at cycle end. The weight table is loaded before any account task
//! starts; loading it inside an account task would race the fan-out.

use crate::accounts::AccountProcessor;
use crate::aggregator::{SignalAggregator, SymbolTarget};
use crate::cache::ExecutionCache;
use crate::config::{Settings, WeightConfig};
use crate::engine::{ReconciliationEngine, SymbolOrder};
use crate::signals::AssetMapper;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

pub const CYCLE_PERIOD: Duration = Duration::from_secs(10);
/// Overruns are logged, never aborted.
const CYCLE_SOFT_DEADLINE: Duration = Duration::from_secs(60);

/// Owns the per-cycle orchestration state.
pub struct CycleDriver {
    settings: Settings,
    /// Last good weight table; replaced only by a successful reload.
    weight_config: WeightConfig,
    mapper: Arc<RwLock<AssetMapper>>,
    aggregator: SignalAggregator,
    accounts: Vec<Arc<dyn AccountProcessor>>,
    engine: Arc<ReconciliationEngine>,
    cache: ExecutionCache,
    shutdown: watch::Receiver<bool>,
}

impl CycleDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        weight_config: WeightConfig,
        mapper: Arc<RwLock<AssetMapper>>,
        aggregator: SignalAggregator,
        accounts: Vec<Arc<dyn AccountProcessor>>,
        engine: Arc<ReconciliationEngine>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let cache = ExecutionCache::load(settings.execution_cache_path());
        Self {
            settings,
            weight_config,
            mapper,
            aggregator,
            accounts,
            engine,
            cache,
            shutdown,
        }
    }

    /// Run cycles until shutdown. One cycle never overlaps itself; an
    /// overlong cycle simply starts the next one immediately.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        info!(period_s = CYCLE_PERIOD.as_secs(), "Cycle driver started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            self.run_cycle().await;
            let elapsed = started.elapsed();
            if elapsed > CYCLE_SOFT_DEADLINE {
                warn!(elapsed_s = elapsed.as_secs(), "Cycle exceeded soft deadline");
            } else {
                debug!(elapsed_ms = elapsed.as_millis() as u64, "Cycle complete");
            }

            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(CYCLE_PERIOD) => {}
                changed = shutdown.changed() => {
                    // sender gone: nobody can ever signal, keep the cadence
                    if changed.is_err() {
                        tokio::time::sleep(CYCLE_PERIOD).await;
                    }
                }
            }
        }

        // Commit whatever the interrupted cycle confirmed
        if let Err(e) = self.cache.flush().await {
            error!(error = %e, "Final cache flush failed");
        }
        info!("Cycle driver stopped");
        Ok(())
    }

    /// One reconciliation pass. Per-account and per-symbol errors are
    /// contained inside; nothing escapes the cycle.
    pub async fn run_cycle(&mut self) {
        // Weight table first, before any account fan-out
        match WeightConfig::load(self.settings.weight_config_path()) {
            Ok(config) => self.weight_config = config,
            Err(e) => {
                warn!(error = %e, "Weight config reload failed, keeping last good copy");
            }
        }
        if self.weight_config.is_empty() {
            debug!("No symbols configured, nothing to reconcile");
            return;
        }

        self.mapper.write().await.reload();

        let snapshot = self.aggregator.collect().await;
        let targets = SignalAggregator::blend(&self.weight_config, &snapshot);

        // Read once at cycle start; commits from past cycles are on disk
        self.cache = ExecutionCache::load(self.settings.execution_cache_path());

        let mut handles = Vec::new();
        for account in &self.accounts {
            let orders = self.plan_account(account.as_ref(), &targets);
            if orders.is_empty() {
                debug!(account = %account.account_id(), "All symbols clean, skipping account");
                continue;
            }
            let engine = Arc::clone(&self.engine);
            let account = Arc::clone(account);
            handles.push(tokio::spawn(async move {
                engine.run_account(account, orders).await
            }));
        }

        let mut committed = false;
        for handle in handles {
            match handle.await {
                Ok(report) => {
                    if !report.failed.is_empty() {
                        warn!(
                            account = %report.account_id,
                            failed = report.failed.len(),
                            "Some symbols left undone this cycle"
                        );
                    }
                    if !report.confirmed.is_empty() {
                        self.cache.update_account(&report.account_id, report.confirmed);
                        committed = true;
                    }
                }
                Err(e) => error!(error = %e, "Account task panicked"),
            }
        }

        if committed {
            if let Err(e) = self.cache.flush().await {
                error!(error = %e, "Cache flush failed, skip detection degraded next cycle");
            }
        }
    }

    /// Work orders for one account: disabled accounts target zero depth
    /// everywhere, and clean symbols are dropped.
    fn plan_account(
        &self,
        account: &dyn AccountProcessor,
        targets: &[SymbolTarget],
    ) -> Vec<SymbolOrder> {
        let enabled = account.enabled();
        let account_id = account.account_id();

        targets
            .iter()
            .filter_map(|target| {
                let effective = if enabled {
                    target.clone()
                } else {
                    SymbolTarget {
                        depth: Decimal::ZERO,
                        contributing_timestamps: Vec::new(),
                        ..target.clone()
                    }
                };
                let cached = self.cache.entry(account_id, &effective.symbol);
                if SignalAggregator::is_clean(&effective, cached) {
                    debug!(account = %account_id, symbol = %effective.symbol, "Symbol clean");
                    return None;
                }
                Some(SymbolOrder {
                    symbol: effective.symbol,
                    target_depth: effective.depth,
                    leverage: effective.leverage,
                    mark_price_hint: effective.mark_price,
                    contributing_timestamps: effective.contributing_timestamps,
                })
            })
            .collect()
    }
}
