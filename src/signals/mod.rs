//! Signal ingestion.
//!
//! Each signal source implements the `SignalProcessor` contract and
//! normalizes its raw feed into canonical-symbol signals:
//! - `tradingview`: file-backed, reduces webhook trade requests to a
//!   latest-state view with race-pattern handling
//! - `bittensor`: network-polled, reads the external ranker's published
//!   files into an in-memory latest-view on its own cadence

pub mod bittensor;
pub mod mapper;
pub mod tradingview;
mod traits;
mod types;

pub use bittensor::BittensorProcessor;
pub use mapper::AssetMapper;
pub use tradingview::TradingViewProcessor;
pub use traits::SignalProcessor;
pub use types::{CanonicalSignal, SignalAudit};
