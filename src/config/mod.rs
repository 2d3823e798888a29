//! Configuration management.
//!
//! Three layers, reloaded on different cadences:
//! - `Settings`: process-level paths, loaded once at startup from an optional
//!   config file plus `SF__`-prefixed environment variables.
//! - `WeightConfig`: per-symbol source weights and leverage, re-read at the
//!   start of every cycle.
//! - `Credentials`: per-venue API keys, read once at startup.

mod credentials;
mod weights;

pub use credentials::{AccountCredentials, Credentials};
pub use weights::{SourceWeight, WeightConfig, WeightEntry};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Process-level settings: where the config documents and signal data live.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Directory holding the JSON config documents.
    #[serde(default = "default_dir")]
    pub config_dir: PathBuf,
    /// Directory holding raw signal files and the execution cache.
    #[serde(default = "default_dir")]
    pub data_dir: PathBuf,
}

fn default_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: default_dir(),
            data_dir: default_dir(),
        }
    }
}

impl Settings {
    /// Load settings from an optional `config` file and the environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("SF"))
            .build()
            .context("Failed to build settings")?;

        settings
            .try_deserialize()
            .context("Failed to deserialize settings")
    }

    pub fn weight_config_path(&self) -> PathBuf {
        self.config_dir.join("signal_weight_config.json")
    }

    pub fn asset_mapping_path(&self) -> PathBuf {
        self.config_dir.join("asset_mapping_config.json")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.config_dir.join("credentials.json")
    }

    pub fn execution_cache_path(&self) -> PathBuf {
        self.data_dir.join("account_asset_depths.json")
    }

    /// Directory an external producer writes normalized signals into.
    pub fn raw_signals_dir(&self, source_id: &str) -> PathBuf {
        self.data_dir.join("raw_signals").join(source_id)
    }

    /// Settings rooted at an explicit directory (used by tests).
    pub fn rooted_at<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            config_dir: dir.as_ref().to_path_buf(),
            data_dir: dir.as_ref().to_path_buf(),
        }
    }
}
