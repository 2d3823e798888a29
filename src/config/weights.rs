//! Per-symbol signal weight and leverage table.
//!
//! Backed by `signal_weight_config.json`, re-read at the start of every
//! cycle. A file that fails to parse or validate is rejected whole; the
//! caller keeps the last good copy.

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Leverage bounds accepted for any symbol.
pub const MIN_LEVERAGE: u32 = 1;
pub const MAX_LEVERAGE: u32 = 20;

/// Weight one source contributes to a symbol's target depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceWeight {
    pub source: String,
    pub weight: Decimal,
}

/// Blending rule for one canonical symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    pub symbol: String,
    pub leverage: u32,
    pub sources: Vec<SourceWeight>,
}

impl WeightEntry {
    /// Sum of configured source weights.
    pub fn total_weight(&self) -> Decimal {
        self.sources.iter().map(|s| s.weight).sum()
    }
}

/// Validated weight table for all configured symbols.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightConfig {
    entries: Vec<WeightEntry>,
}

impl WeightConfig {
    /// Load and validate the weight table from `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read weight config {:?}", path.as_ref())
        })?;
        let entries: Vec<WeightEntry> =
            serde_json::from_str(&raw).context("Failed to parse weight config")?;
        Self::from_entries(entries)
    }

    /// Validate a set of entries. Any violating entry rejects the whole
    /// table; over-allocated weights are never clamped.
    pub fn from_entries(entries: Vec<WeightEntry>) -> Result<Self> {
        for entry in &entries {
            if entry.leverage < MIN_LEVERAGE || entry.leverage > MAX_LEVERAGE {
                bail!(
                    "Leverage {} for {} outside [{}, {}]",
                    entry.leverage,
                    entry.symbol,
                    MIN_LEVERAGE,
                    MAX_LEVERAGE
                );
            }
            for source in &entry.sources {
                if source.weight < Decimal::ZERO || source.weight > Decimal::ONE {
                    bail!(
                        "Weight {} for {}/{} outside [0, 1]",
                        source.weight,
                        entry.symbol,
                        source.source
                    );
                }
            }
            let total = entry.total_weight();
            if total > Decimal::ONE {
                bail!(
                    "Total weight {} for {} exceeds 1.0",
                    total,
                    entry.symbol
                );
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[WeightEntry] {
        &self.entries
    }

    pub fn entry(&self, symbol: &str) -> Option<&WeightEntry> {
        self.entries.iter().find(|e| e.symbol == symbol)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sources that carry a non-zero weight anywhere in the table. Adapters
    /// for other sources never need to run.
    pub fn active_sources(&self) -> HashSet<String> {
        self.entries
            .iter()
            .flat_map(|e| e.sources.iter())
            .filter(|s| s.weight > Decimal::ZERO)
            .map(|s| s.source.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(symbol: &str, leverage: u32, weights: &[(&str, Decimal)]) -> WeightEntry {
        WeightEntry {
            symbol: symbol.to_string(),
            leverage,
            sources: weights
                .iter()
                .map(|(source, weight)| SourceWeight {
                    source: source.to_string(),
                    weight: *weight,
                })
                .collect(),
        }
    }

    #[test]
    fn test_valid_table_accepted() {
        let config = WeightConfig::from_entries(vec![entry(
            "BTCUSDT",
            3,
            &[("tradingview", dec!(0.10)), ("bittensor", dec!(0.15))],
        )])
        .unwrap();
        assert_eq!(config.entry("BTCUSDT").unwrap().total_weight(), dec!(0.25));
        assert!(config.active_sources().contains("tradingview"));
    }

    #[test]
    fn test_overweight_entry_rejected_not_clamped() {
        let result = WeightConfig::from_entries(vec![entry(
            "BTCUSDT",
            3,
            &[("tradingview", dec!(0.60)), ("bittensor", dec!(0.55))],
        )]);
        assert!(result.is_err());
    }

    #[test]
    fn test_leverage_bounds_enforced() {
        assert!(WeightConfig::from_entries(vec![entry("BTCUSDT", 0, &[])]).is_err());
        assert!(WeightConfig::from_entries(vec![entry("BTCUSDT", 21, &[])]).is_err());
        assert!(WeightConfig::from_entries(vec![entry("BTCUSDT", 20, &[])]).is_ok());
    }

    #[test]
    fn test_zero_weight_sources_not_active() {
        let config = WeightConfig::from_entries(vec![entry(
            "ETHUSDT",
            5,
            &[("tradingview", dec!(0)), ("bittensor", dec!(0.2))],
        )])
        .unwrap();
        let active = config.active_sources();
        assert!(!active.contains("tradingview"));
        assert!(active.contains("bittensor"));
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal_weight_config.json");
        let json = serde_json::json!([
            {
                "symbol": "BTCUSDT",
                "leverage": 3,
                "sources": [
                    {"source": "tradingview", "weight": "0.10"},
                    {"source": "bittensor", "weight": "0.15"}
                ]
            }
        ]);
        std::fs::write(&path, serde_json::to_string_pretty(&json).unwrap()).unwrap();

        let config = WeightConfig::load(&path).unwrap();
        assert_eq!(config.entries().len(), 1);
        assert_eq!(config.entry("BTCUSDT").unwrap().leverage, 3);
    }
}
