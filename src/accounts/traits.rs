//! Venue-agnostic contract for exchange accounts.

use crate::accounts::error::ExchangeError;
use crate::accounts::types::{MarginMode, PositionState, SymbolSpec};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Uniform capability contract every venue adapter implements.
///
/// All symbols crossing this boundary are canonical; each adapter translates
/// to and from its native format internally. Order sizing is the engine's
/// job; adapters only quantize to the venue's lot rules and split orders
/// that exceed the single-order cap.
#[async_trait]
pub trait AccountProcessor: Send + Sync {
    /// Stable account identifier (cache key).
    fn account_id(&self) -> &str;

    /// Venue display name.
    fn exchange_name(&self) -> &str;

    /// Disabled accounts are reconciled to zero depth, not skipped.
    fn enabled(&self) -> bool;

    /// Per-account clamp on configured leverage, when set.
    fn leverage_override(&self) -> Option<u32> {
        None
    }

    /// Venue-native symbol for a canonical one.
    fn map_symbol(&self, canonical: &str) -> String;

    /// Total account equity including unrealized PnL of open positions.
    async fn get_total_equity(&self) -> Result<Decimal, ExchangeError>;

    /// All open positions, keyed by canonical symbol.
    async fn get_positions(&self) -> Result<HashMap<String, PositionState>, ExchangeError>;

    /// Contract trading rules for one symbol.
    async fn get_symbol_spec(&self, symbol: &str) -> Result<SymbolSpec, ExchangeError>;

    /// Last traded price for one symbol.
    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Idempotent; some venues require a flat position and report
    /// `ExchangeError::FlatPositionRequired`.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    /// Idempotent; some venues require a flat position and report
    /// `ExchangeError::FlatPositionRequired`.
    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<(), ExchangeError>;

    /// Place a market order for a signed quantity. The adapter quantizes to
    /// the venue's lot rules and chunks internally when the quantity exceeds
    /// the single-order cap. Returns the signed fill.
    async fn place_market(
        &self,
        symbol: &str,
        signed_qty: Decimal,
        reduce_only: bool,
    ) -> Result<Decimal, ExchangeError>;

    /// Reduce-only market close of the whole position. Returns the signed
    /// fill (zero when already flat).
    async fn close_position(&self, symbol: &str) -> Result<Decimal, ExchangeError>;
}
