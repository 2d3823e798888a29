//! Network-polled Bittensor signal processor.
//!
//! An external ranker polls the subnet, scores miners, and publishes the
//! blended result atomically as JSON files under `raw_signals/bittensor/`.
//! This processor refreshes an in-memory latest-view from those files on its
//! own cadence; `fetch_current` only reads the view, so the trading cycle
//! never waits on the refresh.

use crate::signals::mapper::AssetMapper;
use crate::signals::{CanonicalSignal, SignalAudit, SignalProcessor};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

pub const SIGNAL_SOURCE: &str = "bittensor";
const SIGNAL_FILE_PREFIX: &str = "bittensor_signal";
/// Remote producers refresh slowly; polling faster than this is wasted work.
const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// One published signal entry: `{"depth": ..., "price": ..., "timestamp": ms}`.
#[derive(Debug, Deserialize)]
struct PublishedSignal {
    depth: Decimal,
    #[serde(default)]
    price: Option<Decimal>,
    /// Milliseconds since the epoch.
    timestamp: i64,
}

/// Reads the published Bittensor signal files into a latest-view.
pub struct BittensorProcessor {
    dir: PathBuf,
    mapper: Arc<RwLock<AssetMapper>>,
    view: Arc<RwLock<HashMap<String, CanonicalSignal>>>,
}

impl BittensorProcessor {
    pub fn new(dir: PathBuf, mapper: Arc<RwLock<AssetMapper>>) -> Self {
        Self {
            dir,
            mapper,
            view: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawn the background refresher. Runs until `shutdown` flips true.
    pub fn spawn_refresher(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.refresh().await;
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    changed = shutdown.changed() => {
                        // a dropped sender also means the process is going down
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Re-read the published files and replace the latest-view.
    pub async fn refresh(&self) {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.dir.display(), error = %e, "Bittensor signal directory unreadable");
                return;
            }
        };

        let mapper = self.mapper.read().await.clone();
        let mut unmapped = HashSet::new();
        let mut latest: HashMap<String, CanonicalSignal> = HashMap::new();

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(SIGNAL_FILE_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            let contents = match tokio::fs::read_to_string(entry.path()).await {
                Ok(contents) => contents,
                Err(e) => {
                    warn!(file = %name, error = %e, "Failed to read signal file");
                    continue;
                }
            };
            let published: HashMap<String, PublishedSignal> =
                match serde_json::from_str(&contents) {
                    Ok(published) => published,
                    Err(e) => {
                        warn!(file = %name, error = %e, "Malformed signal file skipped");
                        continue;
                    }
                };

            for (source_symbol, signal) in published {
                let Some(symbol) = mapper.map(SIGNAL_SOURCE, &source_symbol) else {
                    if unmapped.insert(source_symbol.clone()) {
                        debug!(symbol = %source_symbol, "Unmapped source symbol dropped");
                    }
                    continue;
                };
                if signal.depth.abs() > Decimal::ONE {
                    warn!(depth = %signal.depth, symbol, "Depth outside [-1, 1], signal dropped");
                    continue;
                }
                let Some(timestamp) = DateTime::<Utc>::from_timestamp_millis(signal.timestamp)
                else {
                    warn!(timestamp = signal.timestamp, symbol, "Unrepresentable timestamp");
                    continue;
                };
                let candidate = CanonicalSignal {
                    source: SIGNAL_SOURCE.to_string(),
                    symbol: symbol.to_string(),
                    depth: signal.depth,
                    price: signal.price.filter(|p| *p > Decimal::ZERO),
                    timestamp,
                    audit: SignalAudit::unadjusted(timestamp),
                };
                match latest.get(symbol) {
                    Some(existing) if existing.timestamp >= candidate.timestamp => {}
                    _ => {
                        latest.insert(symbol.to_string(), candidate);
                    }
                }
            }
        }

        *self.view.write().await = latest;
    }
}

#[async_trait]
impl SignalProcessor for BittensorProcessor {
    fn source_id(&self) -> &str {
        SIGNAL_SOURCE
    }

    async fn fetch_current(&self) -> Result<Vec<CanonicalSignal>> {
        let view = self.view.read().await;
        let mut signals: Vec<CanonicalSignal> = view.values().cloned().collect();
        signals.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(signals)
    }
}
