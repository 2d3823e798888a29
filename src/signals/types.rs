//! Signal types shared by all processors.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Audit trail for timestamp adjustments made while reducing a raw signal
/// stream to a latest-state view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalAudit {
    pub original_timestamp: DateTime<Utc>,
    pub adjusted: bool,
    pub reason: Option<String>,
}

impl SignalAudit {
    pub fn unadjusted(timestamp: DateTime<Utc>) -> Self {
        Self {
            original_timestamp: timestamp,
            adjusted: false,
            reason: None,
        }
    }
}

/// A signal normalized into the canonical symbol space.
///
/// `depth` is a signed fraction of account equity: `+1` maximally long,
/// `-1` maximally short, `0` flat.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalSignal {
    pub source: String,
    pub symbol: String,
    pub depth: Decimal,
    pub price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    pub audit: SignalAudit,
}

impl CanonicalSignal {
    /// Whether the signal carries a sane depth and price. Violations are
    /// dropped by the adapters with a warning.
    pub fn is_valid(&self) -> bool {
        if self.depth.abs() > Decimal::ONE {
            return false;
        }
        if let Some(price) = self.price {
            if price < Decimal::ZERO {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn signal(depth: Decimal, price: Option<Decimal>) -> CanonicalSignal {
        let now = Utc::now();
        CanonicalSignal {
            source: "tradingview".to_string(),
            symbol: "BTCUSDT".to_string(),
            depth,
            price,
            timestamp: now,
            audit: SignalAudit::unadjusted(now),
        }
    }

    #[test]
    fn test_depth_bounds() {
        assert!(signal(dec!(1), None).is_valid());
        assert!(signal(dec!(-1), None).is_valid());
        assert!(!signal(dec!(1.01), None).is_valid());
        assert!(!signal(dec!(-1.5), None).is_valid());
    }

    #[test]
    fn test_negative_price_invalid() {
        assert!(!signal(dec!(0.5), Some(dec!(-1))).is_valid());
        assert!(signal(dec!(0.5), Some(dec!(50000))).is_valid());
    }
}
