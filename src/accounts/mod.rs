//! Exchange account integrations.
//!
//! Every venue implements the `AccountProcessor` contract; the engine never
//! sees venue-specific types. Included adapters:
//! - `bybit`: Bybit v5 unified account, linear perpetuals
//! - `mock`: in-memory venue for tests and paper trading

pub mod bybit;
mod error;
pub mod mock;
mod spec_cache;
mod traits;
mod types;

pub use bybit::BybitAccount;
pub use error::ExchangeError;
pub use mock::{MockOrder, MockVenue};
pub use spec_cache::{SymbolSpecCache, SPEC_CACHE_TTL};
pub use traits::AccountProcessor;
pub use types::{AccountSnapshot, MarginMode, OrderSide, PositionState, SymbolSpec};
