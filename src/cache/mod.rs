//! Persistent execution cache.
//!
//! One JSON document (`account_asset_depths.json`) keyed by account, mapping
//! canonical symbols to the last confirmed target depth and the signal
//! timestamps that produced it. The cache is advisory: if it is missing or
//! unreadable every symbol is treated as dirty and the next cycle converges
//! again. Writes go through a temp file and an atomic rename so a reader
//! never observes a partial document.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Last confirmed target for one `(account, symbol)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTarget {
    pub target_depth: Decimal,
    /// Epoch-millis of the contributing signals, in configured source order.
    pub contributing_timestamps: Vec<i64>,
}

type AccountEntries = BTreeMap<String, CachedTarget>;

/// In-memory copy of the cache document, read once per cycle and flushed
/// once at cycle end.
#[derive(Debug, Clone)]
pub struct ExecutionCache {
    path: PathBuf,
    accounts: BTreeMap<String, AccountEntries>,
}

impl ExecutionCache {
    /// Load the cache from `path`. Missing or corrupt documents yield an
    /// empty cache; reconciliation then treats every symbol as dirty.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let accounts = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(accounts) => accounts,
                Err(e) => {
                    warn!(error = %e, "Execution cache unparseable, treating all symbols as dirty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(error = %e, "Execution cache unreadable, treating all symbols as dirty");
                BTreeMap::new()
            }
        };
        Self { path, accounts }
    }

    pub fn entry(&self, account: &str, symbol: &str) -> Option<&CachedTarget> {
        self.accounts.get(account)?.get(symbol)
    }

    /// Fold an account's confirmed targets in. Symbols that failed this
    /// cycle are absent from `confirmed` and keep their previous entry.
    pub fn update_account(
        &mut self,
        account: &str,
        confirmed: impl IntoIterator<Item = (String, CachedTarget)>,
    ) {
        let entries = self.accounts.entry(account.to_string()).or_default();
        for (symbol, target) in confirmed {
            entries.insert(symbol, target);
        }
    }

    /// Write the document atomically: temp file, fsync, rename.
    pub async fn flush(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.accounts)
            .context("Failed to serialize execution cache")?;

        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create cache directory {:?}", parent))?;
        }
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("Failed to create cache temp file {:?}", tmp))?;
        file.write_all(json.as_bytes())
            .await
            .context("Failed to write cache temp file")?;
        file.sync_all().await.context("Failed to sync cache temp file")?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace cache file {:?}", self.path))?;

        debug!(path = %self.path.display(), accounts = self.accounts.len(), "Execution cache flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn target(depth: Decimal, timestamps: &[i64]) -> CachedTarget {
        CachedTarget {
            target_depth: depth,
            contributing_timestamps: timestamps.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account_asset_depths.json");

        let mut cache = ExecutionCache::load(&path);
        cache.update_account(
            "bybit",
            [("BTCUSDT".to_string(), target(dec!(0.125), &[1000, 1000]))],
        );
        cache.flush().await.unwrap();

        let reloaded = ExecutionCache::load(&path);
        let entry = reloaded.entry("bybit", "BTCUSDT").unwrap();
        assert_eq!(entry.target_depth, dec!(0.125));
        assert_eq!(entry.contributing_timestamps, vec![1000, 1000]);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ExecutionCache::load(dir.path().join("nope.json"));
        assert!(cache.entry("bybit", "BTCUSDT").is_none());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account_asset_depths.json");
        std::fs::write(&path, "{ definitely not json").unwrap();
        let cache = ExecutionCache::load(&path);
        assert!(cache.entry("bybit", "BTCUSDT").is_none());
    }

    #[tokio::test]
    async fn test_partial_update_keeps_other_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account_asset_depths.json");

        let mut cache = ExecutionCache::load(&path);
        cache.update_account(
            "bybit",
            [
                ("BTCUSDT".to_string(), target(dec!(0.1), &[1])),
                ("ETHUSDT".to_string(), target(dec!(0.2), &[2])),
            ],
        );
        // ETHUSDT failed this cycle; only BTCUSDT is confirmed
        cache.update_account("bybit", [("BTCUSDT".to_string(), target(dec!(0.3), &[3]))]);

        assert_eq!(cache.entry("bybit", "BTCUSDT").unwrap().target_depth, dec!(0.3));
        assert_eq!(cache.entry("bybit", "ETHUSDT").unwrap().target_depth, dec!(0.2));
    }

    #[tokio::test]
    async fn test_flush_is_valid_json_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account_asset_depths.json");

        let mut cache = ExecutionCache::load(&path);
        cache.update_account("mexc", [("BTCUSDT".to_string(), target(dec!(-0.5), &[42]))]);
        cache.flush().await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(parsed.get("mexc").is_some());
        // temp file must not linger
        assert!(!path.with_extension("json.tmp").exists());
    }
}
