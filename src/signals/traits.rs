//! Source-agnostic contract for signal processors.

use crate::signals::CanonicalSignal;
use anyhow::Result;
use async_trait::async_trait;

/// Trait every signal source implements.
///
/// `fetch_current` returns the freshest signal per canonical symbol and is
/// stateless with respect to callers; the aggregator wraps each call in a
/// deadline, so implementations should not install their own long waits.
#[async_trait]
pub trait SignalProcessor: Send + Sync {
    /// Short identifier matching the weight table's `source` field.
    fn source_id(&self) -> &str;

    /// Freshest signal per canonical symbol for this source.
    async fn fetch_current(&self) -> Result<Vec<CanonicalSignal>>;
}
