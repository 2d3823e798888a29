//! Venue credentials, read once at startup from `credentials.json`.
//!
//! The core only cares about account identity and the enabled flag; key
//! material is passed through to the venue adapters opaquely.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// One exchange account entry.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountCredentials {
    pub exchange_name: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub api_passphrase: Option<String>,
    /// Clamps the configured leverage for this account when set.
    #[serde(default)]
    pub leverage_override: Option<u32>,
    pub enabled: bool,
    /// Copy-trading sub-accounts trade independently of the main account.
    #[serde(default)]
    pub copy_trading: bool,
}

impl AccountCredentials {
    /// Stable identifier for this account. Copy-trading sub-accounts get a
    /// distinct id so their positions and cache entries never collide with
    /// the main account.
    pub fn account_id(&self) -> String {
        if self.copy_trading {
            format!("{}-copy", self.exchange_name)
        } else {
            self.exchange_name.clone()
        }
    }
}

/// The credentials document: named venue blocks plus generic entries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub bybit: Option<AccountCredentials>,
    #[serde(default)]
    pub accounts: Vec<AccountCredentials>,
}

impl Credentials {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read credentials {:?}", path.as_ref()))?;
        serde_json::from_str(&raw).context("Failed to parse credentials")
    }

    /// All account entries, named venue blocks first.
    pub fn entries(&self) -> Vec<&AccountCredentials> {
        self.bybit.iter().chain(self.accounts.iter()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_account_ids() {
        let json = r#"
        {
            "bybit": {
                "exchange_name": "bybit",
                "api_key": "key",
                "api_secret": "secret",
                "enabled": true
            },
            "accounts": [
                {
                    "exchange_name": "bybit",
                    "api_key": "key2",
                    "api_secret": "secret2",
                    "enabled": false,
                    "copy_trading": true,
                    "leverage_override": 5
                }
            ]
        }
        "#;
        let creds: Credentials = serde_json::from_str(json).unwrap();
        let entries = creds.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].account_id(), "bybit");
        assert!(entries[0].enabled);
        assert_eq!(entries[1].account_id(), "bybit-copy");
        assert_eq!(entries[1].leverage_override, Some(5));
    }
}
