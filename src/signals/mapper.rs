//! Per-source symbol translation into the canonical symbol space.
//!
//! Backed by `asset_mapping_config.json`: an object of per-source submaps,
//! each mapping a source symbol to its canonical symbol. Submap order is
//! preserved. Reloaded at the start of every cycle; a reload failure keeps
//! the last good copy.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Ordered symbol map for one source, with O(1) lookups both ways.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    ordered: Vec<(String, String)>,
    forward: HashMap<String, String>,
    reverse: HashMap<String, String>,
}

impl SourceMap {
    fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let forward = pairs.iter().cloned().collect();
        let reverse = pairs.iter().map(|(s, c)| (c.clone(), s.clone())).collect();
        Self {
            ordered: pairs,
            forward,
            reverse,
        }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.ordered
    }
}

/// Translation table for all sources.
#[derive(Debug, Clone, Default)]
pub struct AssetMapper {
    path: PathBuf,
    sources: HashMap<String, SourceMap>,
}

impl AssetMapper {
    /// Mapper bound to `path`, starting empty. Call `reload` to populate.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            sources: HashMap::new(),
        }
    }

    /// Load the mapping file, replacing the current table.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut mapper = Self::new(path);
        mapper.reload_strict()?;
        Ok(mapper)
    }

    fn reload_strict(&mut self) -> Result<()> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read asset mapping {:?}", self.path))?;
        // serde_json's preserve_order keeps the submap entry order from the file
        let parsed: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&raw).context("Failed to parse asset mapping")?;

        let mut sources = HashMap::new();
        for (source, submap) in parsed {
            let submap = submap
                .as_object()
                .with_context(|| format!("Mapping for source {source} is not an object"))?;
            let pairs = submap
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|c| (k.clone(), c.to_string())))
                .collect();
            sources.insert(source, SourceMap::from_pairs(pairs));
        }
        self.sources = sources;
        Ok(())
    }

    /// Re-read the mapping file; on failure keep the last good copy.
    pub fn reload(&mut self) {
        if let Err(e) = self.reload_strict() {
            warn!(error = %e, "Asset mapping reload failed, keeping last good copy");
        }
    }

    /// Canonical symbol for `source_symbol` under `source`, if mapped.
    pub fn map(&self, source: &str, source_symbol: &str) -> Option<&str> {
        self.sources
            .get(source)?
            .forward
            .get(source_symbol)
            .map(String::as_str)
    }

    /// Source-native symbol for `canonical` under `source`, if mapped.
    pub fn reverse(&self, source: &str, canonical: &str) -> Option<&str> {
        self.sources
            .get(source)?
            .reverse
            .get(canonical)
            .map(String::as_str)
    }

    pub fn source(&self, source: &str) -> Option<&SourceMap> {
        self.sources.get(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_mapping(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("asset_mapping_config.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_forward_and_reverse_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(
            dir.path(),
            r#"{
                "tradingview": {"BTCUSDT": "BTCUSDT", "ETHUSDT.P": "ETHUSDT"},
                "bittensor": {"BTCUSD": "BTCUSDT"}
            }"#,
        );

        let mapper = AssetMapper::load(&path).unwrap();
        assert_eq!(mapper.map("tradingview", "ETHUSDT.P"), Some("ETHUSDT"));
        assert_eq!(mapper.map("bittensor", "BTCUSD"), Some("BTCUSDT"));
        assert_eq!(mapper.map("bittensor", "XRPUSD"), None);
        assert_eq!(mapper.reverse("bittensor", "BTCUSDT"), Some("BTCUSD"));
    }

    #[test]
    fn test_submap_order_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(
            dir.path(),
            r#"{"tradingview": {"ZZZ": "ZZZUSDT", "AAA": "AAAUSDT", "MMM": "MMMUSDT"}}"#,
        );

        let mapper = AssetMapper::load(&path).unwrap();
        let keys: Vec<&str> = mapper
            .source("tradingview")
            .unwrap()
            .pairs()
            .iter()
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(keys, vec!["ZZZ", "AAA", "MMM"]);
    }

    #[test]
    fn test_reload_failure_keeps_last_good() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(dir.path(), r#"{"tradingview": {"BTCUSDT": "BTCUSDT"}}"#);

        let mut mapper = AssetMapper::load(&path).unwrap();
        std::fs::write(&path, "{ not json").unwrap();
        mapper.reload();
        assert_eq!(mapper.map("tradingview", "BTCUSDT"), Some("BTCUSDT"));
    }
}
