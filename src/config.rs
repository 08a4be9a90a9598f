//! Runtime configuration for object-cache-tier.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. All tier knobs (directories, capacities, block sizes,
//! snapshot paths) live here; the engine itself never reads ambient state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage tier configuration.
    #[serde(default)]
    pub tiers: TiersConfig,
}

/// Per-tier configuration, fastest to slowest. Any tier may be absent;
/// at least one must be configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiersConfig {
    /// Memory tier (tmpfs-backed directory).
    #[serde(default)]
    pub mem: Option<TierConfig>,

    /// Solid-state tier.
    #[serde(default)]
    pub ssd: Option<TierConfig>,

    /// Spinning-disk tier.
    #[serde(default)]
    pub hdd: Option<TierConfig>,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            mem: Some(TierConfig {
                dir: std::env::temp_dir().join("object-cache-tier"),
                capacity: 256 * 1024 * 1024,
                block_size: 4 * 1024 * 1024,
                snapshot_path: None,
            }),
            ssd: None,
            hdd: None,
        }
    }
}

/// Configuration for one storage tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Directory holding this tier's block files.
    pub dir: PathBuf,

    /// Capacity budget in bytes. Eviction keeps the sum of live block
    /// sizes at or under this.
    pub capacity: u64,

    /// Nominal block size in bytes. Items larger than this get a dedicated
    /// oversized block.
    pub block_size: u64,

    /// Path of the index snapshot file. Defaults to `index.json` inside
    /// `dir`.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

impl TierConfig {
    /// Resolved snapshot file path for this tier.
    pub fn snapshot_file(&self) -> PathBuf {
        self.snapshot_path
            .clone()
            .unwrap_or_else(|| self.dir.join("index.json"))
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_mem_tier() {
        let cfg = Config::default();
        let mem = cfg.tiers.mem.expect("default config has a mem tier");
        assert_eq!(mem.block_size, 4 * 1024 * 1024);
        assert!(cfg.tiers.ssd.is_none());
        assert!(cfg.tiers.hdd.is_none());
    }

    #[test]
    fn test_snapshot_path_defaults_into_dir() {
        let tier = TierConfig {
            dir: PathBuf::from("/var/cache/mem"),
            capacity: 1024,
            block_size: 256,
            snapshot_path: None,
        };
        assert_eq!(
            tier.snapshot_file(),
            PathBuf::from("/var/cache/mem/index.json")
        );
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"tiers":{"hdd":{"dir":"/data/hdd","capacity":1000,"block_size":100}}}"#,
        )
        .unwrap();
        assert!(cfg.tiers.mem.is_none());
        let hdd = cfg.tiers.hdd.unwrap();
        assert_eq!(hdd.capacity, 1000);
        assert!(hdd.snapshot_path.is_none());
    }
}
