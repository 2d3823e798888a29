//! Unified account-side types shared across venue adapters.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Margin mode for a derivatives position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Isolated,
    Cross,
}

impl fmt::Display for MarginMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarginMode::Isolated => write!(f, "isolated"),
            MarginMode::Cross => write!(f, "cross"),
        }
    }
}

/// Order side, derived from the sign of a quantity delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side that moves a position by `delta`.
    pub fn from_delta(delta: Decimal) -> Self {
        if delta < Decimal::ZERO {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "Buy"),
            OrderSide::Sell => write!(f, "Sell"),
        }
    }
}

/// One open position as reported by a venue, normalized.
///
/// `size` is signed: positive long, negative short.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionState {
    pub size: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
    pub margin_mode: MarginMode,
}

/// Account state captured once per cycle and shared by every symbol task
/// under that account. Frozen after capture.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    /// Total equity including unrealized PnL of open positions.
    pub total_equity: Decimal,
    /// Open positions keyed by canonical symbol.
    pub positions: HashMap<String, PositionState>,
}

impl AccountSnapshot {
    /// Signed size of the position in `symbol`, zero when flat.
    pub fn position_size(&self, symbol: &str) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO)
    }
}

/// Contract trading rules reported by a venue for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolSpec {
    /// Smallest order quantity the venue accepts.
    pub min_size: Decimal,
    /// Quantity granularity.
    pub size_step: Decimal,
    /// Price granularity.
    pub price_step: Decimal,
    /// Largest quantity a single market order may carry.
    pub max_single_order_size: Decimal,
    /// Quantity of the base asset one contract represents.
    pub contract_multiplier: Decimal,
    /// Highest leverage the venue permits on this contract.
    pub max_leverage: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_side_from_delta() {
        assert_eq!(OrderSide::from_delta(dec!(0.5)), OrderSide::Buy);
        assert_eq!(OrderSide::from_delta(dec!(-0.5)), OrderSide::Sell);
    }

    #[test]
    fn test_snapshot_position_size_defaults_to_flat() {
        let snapshot = AccountSnapshot {
            total_equity: dec!(10000),
            positions: HashMap::new(),
        };
        assert_eq!(snapshot.position_size("BTCUSDT"), Decimal::ZERO);
    }
}
