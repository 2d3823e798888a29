//! Error type shared by all venue adapters.

use thiserror::Error;

/// Failure modes a venue operation can report.
///
/// The retry layer uses `is_retryable` to separate transient faults from
/// errors that must surface immediately.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network-level failure (connect, TLS, body read).
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// Venue asked us to slow down.
    #[error("rate limited by venue")]
    RateLimited,

    /// Venue rejected the request with an application-level code.
    #[error("venue error {code}: {message}")]
    Venue { code: i64, message: String },

    /// Credentials rejected; never retried.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Leverage or margin-mode change requires a flat position first.
    #[error("venue requires a flat position for this change")]
    FlatPositionRequired,

    /// The venue does not list this contract.
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// Response body did not match the expected shape.
    #[error("malformed venue response: {0}")]
    Parse(String),
}

impl ExchangeError {
    /// Whether the operation may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transport(_) | ExchangeError::Timeout | ExchangeError::RateLimited
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExchangeError::Timeout
        } else if e.is_decode() {
            ExchangeError::Parse(e.to_string())
        } else {
            ExchangeError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExchangeError::Timeout.is_retryable());
        assert!(ExchangeError::RateLimited.is_retryable());
        assert!(ExchangeError::Transport("reset".into()).is_retryable());
        assert!(!ExchangeError::Auth("bad key".into()).is_retryable());
        assert!(!ExchangeError::Venue { code: 500, message: "oops".into() }.is_retryable());
        assert!(!ExchangeError::FlatPositionRequired.is_retryable());
    }
}
