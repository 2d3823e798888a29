//! Short-TTL memoization of venue-reported contract specs.
//!
//! Specs change rarely; caching them halves the adapter queries a cycle
//! makes. Entries expire after the TTL and are invalidated explicitly when a
//! leverage or margin-mode change may alter the contract rules.

use crate::accounts::error::ExchangeError;
use crate::accounts::traits::AccountProcessor;
use crate::accounts::types::SymbolSpec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

pub const SPEC_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct CachedSpec {
    fetched_at: Instant,
    spec: SymbolSpec,
}

/// `(account, symbol)`-keyed spec cache, shared across symbol tasks.
/// Append-wins: a stale overwrite is benign.
#[derive(Debug, Clone, Default)]
pub struct SymbolSpecCache {
    entries: Arc<RwLock<HashMap<(String, String), CachedSpec>>>,
}

impl SymbolSpecCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached spec, or fetch from the venue and remember it.
    pub async fn get(
        &self,
        account: &dyn AccountProcessor,
        symbol: &str,
    ) -> Result<SymbolSpec, ExchangeError> {
        let key = (account.account_id().to_string(), symbol.to_string());
        {
            let entries = self.entries.read().await;
            if let Some(cached) = entries.get(&key) {
                if cached.fetched_at.elapsed() < SPEC_CACHE_TTL {
                    return Ok(cached.spec.clone());
                }
            }
        }

        let spec = account.get_symbol_spec(symbol).await?;
        debug!(account = %key.0, %symbol, "Symbol spec fetched");
        self.entries.write().await.insert(
            key,
            CachedSpec {
                fetched_at: Instant::now(),
                spec: spec.clone(),
            },
        );
        Ok(spec)
    }

    /// Drop the entry for `(account, symbol)`, forcing a refetch.
    pub async fn invalidate(&self, account_id: &str, symbol: &str) {
        self.entries
            .write()
            .await
            .remove(&(account_id.to_string(), symbol.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::mock::MockVenue;
    use rust_decimal_macros::dec;

    fn btc_spec() -> SymbolSpec {
        SymbolSpec {
            min_size: dec!(0.001),
            size_step: dec!(0.001),
            price_step: dec!(0.1),
            max_single_order_size: dec!(100),
            contract_multiplier: dec!(1),
            max_leverage: 100,
        }
    }

    #[tokio::test]
    async fn test_second_lookup_is_cached() {
        let venue = MockVenue::new("bybit", dec!(10000));
        venue.set_symbol_spec("BTCUSDT", btc_spec()).await;

        let cache = SymbolSpecCache::new();
        cache.get(&venue, "BTCUSDT").await.unwrap();
        cache.get(&venue, "BTCUSDT").await.unwrap();

        assert_eq!(venue.op_count("get_symbol_spec").await, 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let venue = MockVenue::new("bybit", dec!(10000));
        venue.set_symbol_spec("BTCUSDT", btc_spec()).await;

        let cache = SymbolSpecCache::new();
        cache.get(&venue, "BTCUSDT").await.unwrap();
        cache.invalidate("bybit", "BTCUSDT").await;
        cache.get(&venue, "BTCUSDT").await.unwrap();

        assert_eq!(venue.op_count("get_symbol_spec").await, 2);
    }

    #[tokio::test]
    async fn test_accounts_do_not_share_entries() {
        let venue_a = MockVenue::new("bybit", dec!(10000));
        let venue_b = MockVenue::new("mexc", dec!(10000));
        venue_a.set_symbol_spec("BTCUSDT", btc_spec()).await;
        venue_b.set_symbol_spec("BTCUSDT", btc_spec()).await;

        let cache = SymbolSpecCache::new();
        cache.get(&venue_a, "BTCUSDT").await.unwrap();
        cache.get(&venue_b, "BTCUSDT").await.unwrap();

        assert_eq!(venue_a.op_count("get_symbol_spec").await, 1);
        assert_eq!(venue_b.op_count("get_symbol_spec").await, 1);
    }
}
