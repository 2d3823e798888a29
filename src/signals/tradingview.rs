//! File-backed TradingView signal processor.
//!
//! An external webhook receiver appends normalized trade requests to line
//! files under `raw_signals/tradingview/`. Each line is
//! `"<date> <time> <json>"`. This processor reduces the recent files to the
//! latest state per canonical symbol, handling the close/open race pattern
//! single-threaded strategies produce when they flip positions.

use crate::signals::mapper::AssetMapper;
use crate::signals::{CanonicalSignal, SignalAudit, SignalProcessor};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const SIGNAL_SOURCE: &str = "tradingview";
const SIGNAL_FILE_PREFIX: &str = "trade_requests";
/// Only files the producer touched recently are read; older ones are its
/// archiver's problem.
const RECENT_WINDOW: Duration = Duration::from_secs(3 * 24 * 60 * 60);
/// Two same-symbol signals closer than this form one position transition.
const CLOSE_THRESHOLD_MS: i64 = 5_000;

/// One trade request line as the webhook receiver writes it.
#[derive(Debug, Deserialize)]
struct TradeRequest {
    symbol: String,
    direction: String,
    #[serde(default)]
    size: String,
    #[serde(default)]
    price: Option<Decimal>,
}

#[derive(Debug, Clone)]
struct ParsedSignal {
    symbol: String,
    depth: Decimal,
    price: Option<Decimal>,
    timestamp: DateTime<Utc>,
    original_timestamp: DateTime<Utc>,
    adjusted: bool,
    adjustment_reason: Option<String>,
}

impl ParsedSignal {
    fn is_flat(&self) -> bool {
        self.depth == Decimal::ZERO
    }
}

/// Reads the raw TradingView signal store.
pub struct TradingViewProcessor {
    dir: PathBuf,
    mapper: Arc<RwLock<AssetMapper>>,
}

impl TradingViewProcessor {
    pub fn new(dir: PathBuf, mapper: Arc<RwLock<AssetMapper>>) -> Self {
        Self { dir, mapper }
    }

    async fn recent_files(&self) -> Vec<PathBuf> {
        let cutoff = SystemTime::now() - RECENT_WINDOW;
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Signal directory unreadable");
                return files;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(SIGNAL_FILE_PREFIX) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            match meta.modified() {
                Ok(modified) if modified >= cutoff => files.push(entry.path()),
                _ => {}
            }
        }
        files.sort();
        files
    }

    /// Parse the depth encoded as `direction` plus `size` (`"<n>/<d>"`).
    fn parse_depth(direction: &str, size: &str) -> Option<Decimal> {
        if direction == "flat" {
            return Some(Decimal::ZERO);
        }
        let (numerator, denominator) = size.trim().split_once('/')?;
        let numerator: Decimal = numerator.trim().parse().ok()?;
        let denominator: Decimal = denominator.trim().parse().ok()?;
        if denominator == Decimal::ZERO {
            return None;
        }
        let mut depth = (numerator / denominator).abs();
        if numerator < Decimal::ZERO || direction == "short" {
            depth = -depth;
        }
        Some(depth)
    }

    fn parse_line(
        line: &str,
        mapper: &AssetMapper,
        unmapped: &mut HashSet<String>,
    ) -> Option<ParsedSignal> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let mut parts = line.splitn(3, ' ');
        let (date, time, payload) = (parts.next()?, parts.next()?, parts.next()?);
        let timestamp =
            match NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S%.f")
            {
                Ok(naive) => naive.and_utc(),
                Err(_) => {
                    warn!(line, "Invalid timestamp, line skipped");
                    return None;
                }
            };

        let request: TradeRequest = match serde_json::from_str(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Malformed signal line skipped");
                return None;
            }
        };

        if !matches!(request.direction.as_str(), "long" | "short" | "flat") {
            warn!(direction = %request.direction, "Unknown direction, line skipped");
            return None;
        }

        let Some(symbol) = mapper.map(SIGNAL_SOURCE, &request.symbol) else {
            if unmapped.insert(request.symbol.clone()) {
                debug!(symbol = %request.symbol, "Unmapped source symbol dropped");
            }
            return None;
        };

        let Some(depth) = Self::parse_depth(&request.direction, &request.size) else {
            warn!(size = %request.size, "Unparseable size, line skipped");
            return None;
        };
        if depth.abs() > Decimal::ONE {
            warn!(%depth, symbol, "Depth outside [-1, 1], line skipped");
            return None;
        }

        let price = request.price.filter(|p| *p > Decimal::ZERO);

        Some(ParsedSignal {
            symbol: symbol.to_string(),
            depth,
            price,
            timestamp,
            original_timestamp: timestamp,
            adjusted: false,
            adjustment_reason: None,
        })
    }

    /// Collapse position-transition pairs that arrive within the close
    /// threshold. A close and an open belong together as close-then-open
    /// regardless of arrival order: the pair is ordered `[flat, position]`,
    /// and the position signal is re-anchored 1 ms after the flat so it
    /// survives as the terminal state even when the close arrived late.
    fn handle_race_conditions(signals: &mut [ParsedSignal]) {
        let mut i = 0;
        while i + 1 < signals.len() {
            let gap = signals[i + 1].timestamp - signals[i].timestamp;
            let is_transition = signals[i].is_flat() != signals[i + 1].is_flat();
            if is_transition
                && gap >= ChronoDuration::zero()
                && gap <= ChronoDuration::milliseconds(CLOSE_THRESHOLD_MS)
            {
                // position-then-flat arrived out of order: flat comes first
                if !signals[i].is_flat() {
                    signals.swap(i, i + 1);
                }
                signals[i + 1].timestamp =
                    signals[i].timestamp + ChronoDuration::milliseconds(1);
                signals[i + 1].adjusted = true;
                signals[i + 1].adjustment_reason =
                    Some("position_transition_reorder".to_string());
                i += 2;
                continue;
            }
            i += 1;
        }
    }
}

#[async_trait]
impl SignalProcessor for TradingViewProcessor {
    fn source_id(&self) -> &str {
        SIGNAL_SOURCE
    }

    async fn fetch_current(&self) -> Result<Vec<CanonicalSignal>> {
        let mapper = self.mapper.read().await.clone();
        let mut unmapped = HashSet::new();
        let mut by_symbol: HashMap<String, Vec<ParsedSignal>> = HashMap::new();

        for path in self.recent_files().await {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read signal file {:?}", path))?;
            for line in contents.lines() {
                if let Some(signal) = Self::parse_line(line, &mapper, &mut unmapped) {
                    by_symbol.entry(signal.symbol.clone()).or_default().push(signal);
                }
            }
        }

        let mut latest = Vec::new();
        for (_, mut signals) in by_symbol {
            signals.sort_by_key(|s| s.timestamp);
            Self::handle_race_conditions(&mut signals);
            if let Some(signal) = signals.into_iter().max_by_key(|s| s.timestamp) {
                latest.push(CanonicalSignal {
                    source: SIGNAL_SOURCE.to_string(),
                    symbol: signal.symbol,
                    depth: signal.depth,
                    price: signal.price,
                    timestamp: signal.timestamp,
                    audit: SignalAudit {
                        original_timestamp: signal.original_timestamp,
                        adjusted: signal.adjusted,
                        reason: signal.adjustment_reason,
                    },
                });
            }
        }
        latest.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(latest)
    }
}
