//! Three-level parallel reconciliation engine.
//!
//! Level 1: all enabled accounts run concurrently. Level 2: dirty symbols
//! under one account fan out under a per-account semaphore. Level 3: the
//! per-symbol state machine is strictly sequential
//! (INSPECT -> adjust -> RESIZE -> VERIFY).
//!
//! Account equity and positions are snapshotted exactly once per account per
//! cycle, before any symbol task runs; every symbol task sizes against the
//! same equity so portfolio fractions sum correctly even as positions move
//! mid-cycle. A failed symbol is isolated: its cache entry stays untouched
//! and every other symbol and account proceeds.

use crate::accounts::{
    AccountProcessor, AccountSnapshot, ExchangeError, MarginMode, PositionState, SymbolSpec,
    SymbolSpecCache,
};
use crate::cache::CachedTarget;
use crate::utils::decimal::quantize_target;
use crate::utils::retry::{with_retry, RetryConfig};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Dirty symbols under one account reconcile concurrently up to this bound.
pub const PER_ACCOUNT_SYMBOL_CONCURRENCY: usize = 10;
/// Re-entries into INSPECT after a failed attempt.
pub const MAX_RECONCILE_RETRIES: u32 = 2;
/// A market order slower than this is treated as a retryable failure.
const ORDER_DEADLINE: Duration = Duration::from_secs(15);

/// Work order for one `(account, symbol)` this cycle.
#[derive(Debug, Clone)]
pub struct SymbolOrder {
    pub symbol: String,
    /// Blended target depth, signed fraction of equity.
    pub target_depth: Decimal,
    pub leverage: u32,
    /// Price of the freshest contributing signal, if any.
    pub mark_price_hint: Option<Decimal>,
    /// Folded into the cache entry on success.
    pub contributing_timestamps: Vec<i64>,
}

impl SymbolOrder {
    fn cache_entry(&self) -> CachedTarget {
        CachedTarget {
            target_depth: self.target_depth,
            contributing_timestamps: self.contributing_timestamps.clone(),
        }
    }
}

/// Result of one account's reconciliation pass.
#[derive(Debug, Default)]
pub struct AccountReport {
    pub account_id: String,
    /// Symbols whose targets were confirmed; folded into the cache.
    pub confirmed: Vec<(String, CachedTarget)>,
    /// Symbols left undone this cycle.
    pub failed: Vec<String>,
}

/// Drives position reconciliation across accounts.
pub struct ReconciliationEngine {
    spec_cache: SymbolSpecCache,
    shutdown: watch::Receiver<bool>,
}

impl ReconciliationEngine {
    pub fn new(spec_cache: SymbolSpecCache, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            spec_cache,
            shutdown,
        }
    }

    /// Reconcile all dirty symbols for one account.
    ///
    /// Snapshots equity and positions once, fans symbol tasks out under the
    /// per-account semaphore, and reports per-symbol outcomes.
    pub async fn run_account(
        &self,
        account: Arc<dyn AccountProcessor>,
        orders: Vec<SymbolOrder>,
    ) -> AccountReport {
        let account_id = account.account_id().to_string();
        let mut report = AccountReport {
            account_id: account_id.clone(),
            ..Default::default()
        };
        if orders.is_empty() {
            return report;
        }

        let snapshot = match Self::capture_snapshot(account.as_ref()).await {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                error!(account = %account_id, error = %e, "Account snapshot failed, skipping account");
                report.failed = orders.into_iter().map(|o| o.symbol).collect();
                return report;
            }
        };
        info!(
            account = %account_id,
            equity = %snapshot.total_equity,
            open_positions = snapshot.positions.len(),
            dirty_symbols = orders.len(),
            "Reconciling account"
        );

        let semaphore = Arc::new(Semaphore::new(PER_ACCOUNT_SYMBOL_CONCURRENCY));
        let mut handles = Vec::with_capacity(orders.len());
        for order in orders {
            let semaphore = Arc::clone(&semaphore);
            let account = Arc::clone(&account);
            let snapshot = Arc::clone(&snapshot);
            let spec_cache = self.spec_cache.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                if *shutdown.borrow() {
                    debug!(symbol = %order.symbol, "Shutdown requested, symbol left undone");
                    return (order, Err(ExchangeError::Timeout));
                }
                let result =
                    reconcile_symbol(account.as_ref(), &spec_cache, &snapshot, &order).await;
                (order, result)
            }));
        }

        for handle in handles {
            let Ok((order, result)) = handle.await else {
                continue;
            };
            match result {
                Ok(()) => report.confirmed.push((order.symbol.clone(), order.cache_entry())),
                Err(e) => {
                    error!(
                        account = %account_id,
                        symbol = %order.symbol,
                        error = %e,
                        "Symbol reconciliation failed, cache entry unchanged"
                    );
                    report.failed.push(order.symbol);
                }
            }
        }
        report
    }

    async fn capture_snapshot(
        account: &dyn AccountProcessor,
    ) -> Result<AccountSnapshot, ExchangeError> {
        let retry = RetryConfig::default();
        let total_equity = with_retry(
            &retry,
            || account.get_total_equity(),
            ExchangeError::is_retryable,
        )
        .await?;
        let positions = with_retry(
            &retry,
            || account.get_positions(),
            ExchangeError::is_retryable,
        )
        .await?;
        Ok(AccountSnapshot {
            total_equity,
            positions,
        })
    }
}

/// Resolve the mark price: freshest signal price, then the position's entry
/// price, then a venue ticker lookup.
async fn resolve_mark_price(
    account: &dyn AccountProcessor,
    order: &SymbolOrder,
    position: Option<&PositionState>,
) -> Result<Decimal, ExchangeError> {
    if let Some(price) = order.mark_price_hint {
        if price > Decimal::ZERO {
            return Ok(price);
        }
    }
    if let Some(position) = position {
        if position.entry_price > Decimal::ZERO {
            return Ok(position.entry_price);
        }
    }
    with_retry(
        &RetryConfig::default(),
        || account.get_mark_price(&order.symbol),
        ExchangeError::is_retryable,
    )
    .await
}

async fn place_market(
    account: &dyn AccountProcessor,
    symbol: &str,
    delta: Decimal,
    reduce_only: bool,
) -> Result<Decimal, ExchangeError> {
    with_retry(
        &RetryConfig::order(),
        || async {
            tokio::time::timeout(ORDER_DEADLINE, account.place_market(symbol, delta, reduce_only))
                .await
                .map_err(|_| ExchangeError::Timeout)?
        },
        ExchangeError::is_retryable,
    )
    .await
}

async fn close_position(
    account: &dyn AccountProcessor,
    symbol: &str,
) -> Result<Decimal, ExchangeError> {
    with_retry(
        &RetryConfig::order(),
        || async {
            tokio::time::timeout(ORDER_DEADLINE, account.close_position(symbol))
                .await
                .map_err(|_| ExchangeError::Timeout)?
        },
        ExchangeError::is_retryable,
    )
    .await
}

/// Apply a leverage or margin-mode change; when the venue demands a flat
/// position first, close and re-apply. Returns the position size afterwards.
async fn apply_with_flat_fallback<F, Fut>(
    account: &dyn AccountProcessor,
    symbol: &str,
    mut current_size: Decimal,
    apply: F,
) -> Result<Decimal, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), ExchangeError>>,
{
    match apply().await {
        Ok(()) => Ok(current_size),
        Err(ExchangeError::FlatPositionRequired) => {
            info!(%symbol, "Venue requires flat position for change, closing first");
            close_position(account, symbol).await?;
            current_size = Decimal::ZERO;
            apply().await?;
            Ok(current_size)
        }
        Err(e) => Err(e),
    }
}

/// One attempt of the INSPECT -> adjust -> RESIZE -> VERIFY sequence.
async fn reconcile_attempt(
    account: &dyn AccountProcessor,
    spec_cache: &SymbolSpecCache,
    snapshot: &AccountSnapshot,
    order: &SymbolOrder,
    spec: &SymbolSpec,
    position: Option<PositionState>,
) -> Result<(), ExchangeError> {
    let symbol = order.symbol.as_str();
    let leverage = account.leverage_override().unwrap_or(order.leverage);
    let desired_mode = MarginMode::Isolated;

    // INSPECT
    let mut current = position.as_ref().map(|p| p.size).unwrap_or(Decimal::ZERO);
    let mark_price = resolve_mark_price(account, order, position.as_ref()).await?;
    if mark_price <= Decimal::ZERO {
        return Err(ExchangeError::Parse(format!(
            "no usable mark price for {symbol}"
        )));
    }

    let raw_target =
        order.target_depth * snapshot.total_equity * Decimal::from(leverage) / mark_price;
    let target = quantize_target(raw_target, spec.size_step, spec.min_size);

    let leverage_matches = position.as_ref().map_or(true, |p| p.leverage == leverage);
    let mode_matches = position.as_ref().map_or(true, |p| p.margin_mode == desired_mode);

    debug!(
        %symbol,
        %current,
        %target,
        %mark_price,
        leverage,
        "Inspected position"
    );

    // NOOP
    if (current - target).abs() < spec.size_step && leverage_matches && mode_matches {
        debug!(%symbol, "Position already at target");
        return Ok(());
    }

    // FLIP: never cross zero with a single order
    if current != Decimal::ZERO
        && target != Decimal::ZERO
        && current.is_sign_positive() != target.is_sign_positive()
    {
        info!(%symbol, %current, %target, "Position flip, closing before re-opening");
        close_position(account, symbol).await?;
        current = Decimal::ZERO;
    }

    // Margin mode, then leverage. Opening from flat also passes through
    // here so the venue state is right before the first order.
    if !mode_matches || (current == Decimal::ZERO && target != Decimal::ZERO) {
        current = apply_with_flat_fallback(account, symbol, current, || {
            account.set_margin_mode(symbol, desired_mode)
        })
        .await?;
    }
    if !leverage_matches || (current == Decimal::ZERO && target != Decimal::ZERO) {
        current = apply_with_flat_fallback(account, symbol, current, || {
            account.set_leverage(symbol, leverage)
        })
        .await?;
        // Contract rules can change with leverage
        spec_cache.invalidate(account.account_id(), symbol).await;
    }

    // CLOSE / RESIZE
    if target == Decimal::ZERO {
        if current != Decimal::ZERO {
            info!(%symbol, %current, "Flat target, closing position");
            close_position(account, symbol).await?;
        }
    } else {
        let delta = target - current;
        if delta.abs() >= spec.size_step {
            let reduce_only = current.is_sign_positive() == target.is_sign_positive()
                && target.abs() < current.abs()
                && current != Decimal::ZERO;
            info!(%symbol, %delta, reduce_only, "Placing resize order");
            place_market(account, symbol, delta, reduce_only).await?;
        }
    }

    // VERIFY
    let observed = with_retry(
        &RetryConfig::default(),
        || account.get_positions(),
        ExchangeError::is_retryable,
    )
    .await?
    .get(symbol)
    .map(|p| p.size)
    .unwrap_or(Decimal::ZERO);

    if (observed - target).abs() <= spec.size_step {
        info!(%symbol, %observed, %target, "Position reconciled");
        Ok(())
    } else {
        Err(ExchangeError::Venue {
            code: -1,
            message: format!("verification mismatch: observed {observed}, target {target}"),
        })
    }
}

/// Reconcile one symbol, re-entering from INSPECT up to
/// `MAX_RECONCILE_RETRIES` times on failure.
async fn reconcile_symbol(
    account: &dyn AccountProcessor,
    spec_cache: &SymbolSpecCache,
    snapshot: &AccountSnapshot,
    order: &SymbolOrder,
) -> Result<(), ExchangeError> {
    let symbol = order.symbol.as_str();
    let mut last_error = None;

    for attempt in 0..=MAX_RECONCILE_RETRIES {
        let spec = spec_cache.get(account, symbol).await?;
        // First attempt reads the shared snapshot; retries re-read the venue
        let position = if attempt == 0 {
            snapshot.positions.get(symbol).cloned()
        } else {
            with_retry(
                &RetryConfig::default(),
                || account.get_positions(),
                ExchangeError::is_retryable,
            )
            .await?
            .remove(symbol)
        };

        match reconcile_attempt(account, spec_cache, snapshot, order, &spec, position).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    %symbol,
                    attempt = attempt + 1,
                    max_attempts = MAX_RECONCILE_RETRIES + 1,
                    error = %e,
                    "Reconcile attempt failed"
                );
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or(ExchangeError::Timeout))
}
