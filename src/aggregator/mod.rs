//! Signal aggregation: blend per-source depths into per-symbol targets.
//!
//! Per cycle the aggregator snapshots every signal processor concurrently
//! under a deadline, blends the results through the weight table, and
//! classifies each symbol clean or dirty against the execution cache.

use crate::cache::CachedTarget;
use crate::config::WeightConfig;
use crate::signals::{CanonicalSignal, SignalProcessor};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-source fetch deadline. A slow source contributes nothing this cycle
/// instead of stalling it.
pub const FETCH_DEADLINE: Duration = Duration::from_secs(5);

/// Blended allocation for one canonical symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolTarget {
    pub symbol: String,
    /// Weighted depth, clamped to [-1, 1].
    pub depth: Decimal,
    pub leverage: u32,
    /// Epoch-millis of contributing signals, in configured source order.
    pub contributing_timestamps: Vec<i64>,
    /// Price of the freshest contributing signal, when one carried a price.
    pub mark_price: Option<Decimal>,
}

/// Snapshot of all sources: source id -> symbol -> freshest signal.
pub type SignalSnapshot = HashMap<String, HashMap<String, CanonicalSignal>>;

/// Blends current signals from all processors under the weight table.
pub struct SignalAggregator {
    processors: Vec<Arc<dyn SignalProcessor>>,
}

impl SignalAggregator {
    pub fn new(processors: Vec<Arc<dyn SignalProcessor>>) -> Self {
        Self { processors }
    }

    /// Snapshot every processor concurrently. A source that errors or runs
    /// past the deadline yields an empty map and the cycle continues.
    pub async fn collect(&self) -> SignalSnapshot {
        let mut handles = Vec::with_capacity(self.processors.len());
        for processor in &self.processors {
            let processor = Arc::clone(processor);
            handles.push(tokio::spawn(async move {
                let source = processor.source_id().to_string();
                let result =
                    tokio::time::timeout(FETCH_DEADLINE, processor.fetch_current()).await;
                (source, result)
            }));
        }

        let mut snapshot: SignalSnapshot = HashMap::new();
        for handle in handles {
            let Ok((source, result)) = handle.await else {
                continue;
            };
            let signals = match result {
                Ok(Ok(signals)) => signals,
                Ok(Err(e)) => {
                    warn!(%source, error = %e, "Signal fetch failed, contributing nothing");
                    Vec::new()
                }
                Err(_) => {
                    warn!(%source, deadline_s = FETCH_DEADLINE.as_secs(), "Signal fetch timed out");
                    Vec::new()
                }
            };
            let by_symbol = signals
                .into_iter()
                .filter(|s| {
                    if s.is_valid() {
                        true
                    } else {
                        warn!(symbol = %s.symbol, depth = %s.depth, "Invalid signal dropped");
                        false
                    }
                })
                .map(|s| (s.symbol.clone(), s))
                .collect();
            snapshot.insert(source, by_symbol);
        }
        snapshot
    }

    /// Blend the snapshot through the weight table into per-symbol targets.
    ///
    /// A source with no signal for a symbol contributes zero. The weighted
    /// sum is clamped to [-1, 1]; the weight-table invariant already bounds
    /// it, the clamp guards the composition.
    pub fn blend(config: &WeightConfig, snapshot: &SignalSnapshot) -> Vec<SymbolTarget> {
        let mut targets = Vec::with_capacity(config.entries().len());
        for entry in config.entries() {
            let mut weighted_sum = Decimal::ZERO;
            let mut contributing = Vec::new();
            let mut mark_price = None;
            let mut freshest = None;

            for source in &entry.sources {
                if source.weight <= Decimal::ZERO {
                    continue;
                }
                let Some(signal) = snapshot
                    .get(&source.source)
                    .and_then(|signals| signals.get(&entry.symbol))
                else {
                    continue;
                };
                weighted_sum += source.weight * signal.depth;
                contributing.push(signal.timestamp.timestamp_millis());
                if freshest.map_or(true, |ts| signal.timestamp > ts) {
                    freshest = Some(signal.timestamp);
                    if signal.price.is_some() {
                        mark_price = signal.price;
                    }
                }
            }

            let depth = weighted_sum.clamp(-Decimal::ONE, Decimal::ONE);
            debug!(symbol = %entry.symbol, %depth, leverage = entry.leverage, "Blended target");
            targets.push(SymbolTarget {
                symbol: entry.symbol.clone(),
                depth,
                leverage: entry.leverage,
                contributing_timestamps: contributing,
                mark_price,
            });
        }
        targets
    }

    /// A symbol is clean when both the blended depth and every contributing
    /// timestamp match the last confirmed cache entry.
    pub fn is_clean(target: &SymbolTarget, cached: Option<&CachedTarget>) -> bool {
        match cached {
            Some(cached) => {
                cached.target_depth == target.depth
                    && cached.contributing_timestamps == target.contributing_timestamps
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceWeight, WeightEntry};
    use crate::signals::SignalAudit;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;

    struct StaticProcessor {
        id: &'static str,
        signals: Vec<CanonicalSignal>,
    }

    #[async_trait]
    impl SignalProcessor for StaticProcessor {
        fn source_id(&self) -> &str {
            self.id
        }
        async fn fetch_current(&self) -> Result<Vec<CanonicalSignal>> {
            Ok(self.signals.clone())
        }
    }

    struct StalledProcessor;

    #[async_trait]
    impl SignalProcessor for StalledProcessor {
        fn source_id(&self) -> &str {
            "stalled"
        }
        async fn fetch_current(&self) -> Result<Vec<CanonicalSignal>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    fn ts(millis: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(millis).unwrap()
    }

    fn signal(source: &str, symbol: &str, depth: Decimal, millis: i64) -> CanonicalSignal {
        CanonicalSignal {
            source: source.to_string(),
            symbol: symbol.to_string(),
            depth,
            price: Some(dec!(50000)),
            timestamp: ts(millis),
            audit: SignalAudit::unadjusted(ts(millis)),
        }
    }

    fn btc_config(tv_weight: Decimal, bt_weight: Decimal) -> WeightConfig {
        WeightConfig::from_entries(vec![WeightEntry {
            symbol: "BTCUSDT".to_string(),
            leverage: 3,
            sources: vec![
                SourceWeight {
                    source: "tradingview".to_string(),
                    weight: tv_weight,
                },
                SourceWeight {
                    source: "bittensor".to_string(),
                    weight: bt_weight,
                },
            ],
        }])
        .unwrap()
    }

    fn snapshot_of(signals: Vec<CanonicalSignal>) -> SignalSnapshot {
        let mut snapshot: SignalSnapshot = HashMap::new();
        for s in signals {
            snapshot
                .entry(s.source.clone())
                .or_default()
                .insert(s.symbol.clone(), s);
        }
        snapshot
    }

    #[test]
    fn test_blend_weighted_sum() {
        // 0.5 * 0.10 + 0.5 * 0.15 = 0.125
        let config = btc_config(dec!(0.10), dec!(0.15));
        let snapshot = snapshot_of(vec![
            signal("tradingview", "BTCUSDT", dec!(0.5), 1000),
            signal("bittensor", "BTCUSDT", dec!(0.5), 1000),
        ]);

        let targets = SignalAggregator::blend(&config, &snapshot);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].depth, dec!(0.125));
        assert_eq!(targets[0].leverage, 3);
        assert_eq!(targets[0].contributing_timestamps, vec![1000, 1000]);
        assert_eq!(targets[0].mark_price, Some(dec!(50000)));
    }

    #[test]
    fn test_missing_source_contributes_zero() {
        let config = btc_config(dec!(0.10), dec!(0.15));
        let snapshot = snapshot_of(vec![signal("tradingview", "BTCUSDT", dec!(0.5), 1000)]);

        let targets = SignalAggregator::blend(&config, &snapshot);
        assert_eq!(targets[0].depth, dec!(0.05));
        assert_eq!(targets[0].contributing_timestamps, vec![1000]);
    }

    #[test]
    fn test_opposite_signs_blend_to_flat_target() {
        // Equal weights, opposite depths: the target is flat, not "no opinion"
        let config = btc_config(dec!(0.2), dec!(0.2));
        let snapshot = snapshot_of(vec![
            signal("tradingview", "BTCUSDT", dec!(0.5), 1000),
            signal("bittensor", "BTCUSDT", dec!(-0.5), 2000),
        ]);

        let targets = SignalAggregator::blend(&config, &snapshot);
        assert_eq!(targets[0].depth, Decimal::ZERO);
        assert_eq!(targets[0].contributing_timestamps, vec![1000, 2000]);
    }

    #[test]
    fn test_clean_requires_depth_and_timestamps() {
        let target = SymbolTarget {
            symbol: "BTCUSDT".to_string(),
            depth: dec!(0.125),
            leverage: 3,
            contributing_timestamps: vec![1000, 1000],
            mark_price: None,
        };

        let same = CachedTarget {
            target_depth: dec!(0.125),
            contributing_timestamps: vec![1000, 1000],
        };
        assert!(SignalAggregator::is_clean(&target, Some(&same)));

        let newer_signal = CachedTarget {
            target_depth: dec!(0.125),
            contributing_timestamps: vec![1000, 2000],
        };
        assert!(!SignalAggregator::is_clean(&target, Some(&newer_signal)));

        let different_depth = CachedTarget {
            target_depth: dec!(0.15),
            contributing_timestamps: vec![1000, 1000],
        };
        assert!(!SignalAggregator::is_clean(&target, Some(&different_depth)));

        assert!(!SignalAggregator::is_clean(&target, None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_survives_stalled_source() {
        let aggregator = SignalAggregator::new(vec![
            Arc::new(StaticProcessor {
                id: "tradingview",
                signals: vec![signal("tradingview", "BTCUSDT", dec!(0.5), 1000)],
            }),
            Arc::new(StalledProcessor),
        ]);

        let snapshot = aggregator.collect().await;
        assert_eq!(snapshot.get("tradingview").unwrap().len(), 1);
        assert!(snapshot.get("stalled").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collect_drops_invalid_signals() {
        let aggregator = SignalAggregator::new(vec![Arc::new(StaticProcessor {
            id: "tradingview",
            signals: vec![
                signal("tradingview", "BTCUSDT", dec!(0.5), 1000),
                signal("tradingview", "ETHUSDT", dec!(1.5), 1000),
            ],
        })]);

        let snapshot = aggregator.collect().await;
        let tv = snapshot.get("tradingview").unwrap();
        assert!(tv.contains_key("BTCUSDT"));
        assert!(!tv.contains_key("ETHUSDT"));
    }
}
