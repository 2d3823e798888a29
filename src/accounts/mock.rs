//! Mock venue for engine tests and paper trading.
//!
//! Fills every market order instantly at the configured price, keeps a full
//! order journal for assertions, and supports scripted per-operation
//! failures plus venue quirks (leverage changes requiring a flat position).

use crate::accounts::error::ExchangeError;
use crate::accounts::traits::AccountProcessor;
use crate::accounts::types::{MarginMode, PositionState, SymbolSpec};
use crate::utils::decimal::{chunk_quantity, quantize_order};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// One executed market order (one entry per chunk).
#[derive(Debug, Clone, PartialEq)]
pub struct MockOrder {
    pub symbol: String,
    /// Signed quantity: positive buy, negative sell.
    pub qty: Decimal,
    pub reduce_only: bool,
}

#[derive(Debug, Default)]
struct MockState {
    equity: Decimal,
    positions: HashMap<String, PositionState>,
    prices: HashMap<String, Decimal>,
    specs: HashMap<String, SymbolSpec>,
    symbol_leverage: HashMap<String, u32>,
    symbol_margin_mode: HashMap<String, MarginMode>,
    orders: Vec<MockOrder>,
    op_counts: HashMap<String, u32>,
    /// `(operation, symbol)` -> remaining scripted venue-500 failures.
    /// `u32::MAX` means fail forever; `"*"` matches any symbol.
    fail_on: HashMap<(String, String), u32>,
    leverage_requires_flat: bool,
    margin_requires_flat: bool,
}

/// In-memory venue implementing the full account contract.
pub struct MockVenue {
    account_id: String,
    enabled: bool,
    leverage_override: Option<u32>,
    state: Arc<RwLock<MockState>>,
}

impl MockVenue {
    pub fn new(account_id: &str, equity: Decimal) -> Self {
        let state = MockState {
            equity,
            ..Default::default()
        };
        Self {
            account_id: account_id.to_string(),
            enabled: true,
            leverage_override: None,
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_leverage_override(mut self, leverage: u32) -> Self {
        self.leverage_override = Some(leverage);
        self
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state
            .write()
            .await
            .prices
            .insert(symbol.to_string(), price);
    }

    pub async fn set_symbol_spec(&self, symbol: &str, spec: SymbolSpec) {
        self.state
            .write()
            .await
            .specs
            .insert(symbol.to_string(), spec);
    }

    pub async fn set_position(&self, symbol: &str, position: PositionState) {
        let mut state = self.state.write().await;
        state
            .symbol_leverage
            .insert(symbol.to_string(), position.leverage);
        state
            .symbol_margin_mode
            .insert(symbol.to_string(), position.margin_mode);
        state.positions.insert(symbol.to_string(), position);
    }

    pub async fn set_equity(&self, equity: Decimal) {
        self.state.write().await.equity = equity;
    }

    /// Make `operation` fail with a venue 500 for `symbol` (`"*"` for all).
    pub async fn fail_on(&self, operation: &str, symbol: &str) {
        self.state
            .write()
            .await
            .fail_on
            .insert((operation.to_string(), symbol.to_string()), u32::MAX);
    }

    /// Fail the next `times` calls of `operation` for `symbol`, then recover.
    pub async fn fail_times(&self, operation: &str, symbol: &str, times: u32) {
        self.state
            .write()
            .await
            .fail_on
            .insert((operation.to_string(), symbol.to_string()), times);
    }

    pub async fn set_leverage_requires_flat(&self, requires: bool) {
        self.state.write().await.leverage_requires_flat = requires;
    }

    pub async fn set_margin_requires_flat(&self, requires: bool) {
        self.state.write().await.margin_requires_flat = requires;
    }

    pub async fn orders(&self) -> Vec<MockOrder> {
        self.state.read().await.orders.clone()
    }

    pub async fn op_count(&self, operation: &str) -> u32 {
        self.state
            .read()
            .await
            .op_counts
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    pub async fn position_size(&self, symbol: &str) -> Decimal {
        self.state
            .read()
            .await
            .positions
            .get(symbol)
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO)
    }

    async fn begin_op(&self, operation: &str, symbol: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.write().await;
        *state.op_counts.entry(operation.to_string()).or_default() += 1;
        for key in [
            (operation.to_string(), symbol.to_string()),
            (operation.to_string(), "*".to_string()),
        ] {
            if let Some(remaining) = state.fail_on.get_mut(&key) {
                if *remaining == 0 {
                    continue;
                }
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(ExchangeError::Venue {
                    code: 500,
                    message: format!("scripted failure for {operation}"),
                });
            }
        }
        Ok(())
    }

    fn fill_price(state: &MockState, symbol: &str) -> Decimal {
        state.prices.get(symbol).copied().unwrap_or_else(|| {
            state
                .positions
                .get(symbol)
                .map(|p| p.entry_price)
                .unwrap_or(Decimal::ONE)
        })
    }

    fn apply_fill(state: &mut MockState, symbol: &str, qty: Decimal, reduce_only: bool) {
        let price = Self::fill_price(state, symbol);
        let leverage = state.symbol_leverage.get(symbol).copied().unwrap_or(1);
        let margin_mode = state
            .symbol_margin_mode
            .get(symbol)
            .copied()
            .unwrap_or(MarginMode::Isolated);

        state.orders.push(MockOrder {
            symbol: symbol.to_string(),
            qty,
            reduce_only,
        });

        let position = state
            .positions
            .entry(symbol.to_string())
            .or_insert(PositionState {
                size: Decimal::ZERO,
                entry_price: price,
                leverage,
                margin_mode,
            });
        let was_flat = position.size == Decimal::ZERO;
        position.size += qty;
        if was_flat {
            position.entry_price = price;
            position.leverage = leverage;
            position.margin_mode = margin_mode;
        }
        if position.size == Decimal::ZERO {
            state.positions.remove(symbol);
        }

        debug!(%symbol, %qty, %price, reduce_only, "Mock market order executed");
    }
}

#[async_trait]
impl AccountProcessor for MockVenue {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn exchange_name(&self) -> &str {
        &self.account_id
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn leverage_override(&self) -> Option<u32> {
        self.leverage_override
    }

    fn map_symbol(&self, canonical: &str) -> String {
        canonical.to_string()
    }

    async fn get_total_equity(&self) -> Result<Decimal, ExchangeError> {
        self.begin_op("get_total_equity", "*").await?;
        Ok(self.state.read().await.equity)
    }

    async fn get_positions(&self) -> Result<HashMap<String, PositionState>, ExchangeError> {
        self.begin_op("get_positions", "*").await?;
        Ok(self.state.read().await.positions.clone())
    }

    async fn get_symbol_spec(&self, symbol: &str) -> Result<SymbolSpec, ExchangeError> {
        self.begin_op("get_symbol_spec", symbol).await?;
        self.state
            .read()
            .await
            .specs
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.begin_op("get_mark_price", symbol).await?;
        self.state
            .read()
            .await
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.begin_op("set_leverage", symbol).await?;
        let mut state = self.state.write().await;
        let current = state.positions.get(symbol).map(|p| p.leverage);
        if current == Some(leverage) {
            return Ok(());
        }
        if state.leverage_requires_flat
            && state
                .positions
                .get(symbol)
                .map(|p| p.size != Decimal::ZERO)
                .unwrap_or(false)
        {
            return Err(ExchangeError::FlatPositionRequired);
        }
        state.symbol_leverage.insert(symbol.to_string(), leverage);
        if let Some(position) = state.positions.get_mut(symbol) {
            position.leverage = leverage;
        }
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), ExchangeError> {
        self.begin_op("set_margin_mode", symbol).await?;
        let mut state = self.state.write().await;
        let current = state.positions.get(symbol).map(|p| p.margin_mode);
        if current == Some(mode) {
            return Ok(());
        }
        if state.margin_requires_flat
            && state
                .positions
                .get(symbol)
                .map(|p| p.size != Decimal::ZERO)
                .unwrap_or(false)
        {
            return Err(ExchangeError::FlatPositionRequired);
        }
        state.symbol_margin_mode.insert(symbol.to_string(), mode);
        if let Some(position) = state.positions.get_mut(symbol) {
            position.margin_mode = mode;
        }
        Ok(())
    }

    async fn place_market(
        &self,
        symbol: &str,
        signed_qty: Decimal,
        reduce_only: bool,
    ) -> Result<Decimal, ExchangeError> {
        self.begin_op("place_market", symbol).await?;
        let mut state = self.state.write().await;

        let (step, min_size, max_single) = match state.specs.get(symbol) {
            Some(spec) => (spec.size_step, spec.min_size, spec.max_single_order_size),
            None => (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO),
        };
        let qty = quantize_order(signed_qty, step, min_size);
        if qty == Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }

        let sign = if qty < Decimal::ZERO {
            -Decimal::ONE
        } else {
            Decimal::ONE
        };
        for chunk in chunk_quantity(qty.abs(), max_single) {
            Self::apply_fill(&mut state, symbol, chunk * sign, reduce_only);
        }
        Ok(qty)
    }

    async fn close_position(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.begin_op("close_position", symbol).await?;
        let mut state = self.state.write().await;
        let size = state
            .positions
            .get(symbol)
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO);
        if size == Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        Self::apply_fill(&mut state, symbol, -size, true);
        Ok(-size)
    }
}
