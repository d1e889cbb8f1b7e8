//! Top-level configuration of the SSTable lifecycle.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compaction::CompactionConfig;
use crate::directory::DirectoryConfig;
use crate::error::{SstError, SstResult};
use crate::reshape::ReshapeConfig;

/// Everything needed to open a table directory on every shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SstablesConfig {
    /// Table directory holding the SSTable files.
    pub data_dir: PathBuf,
    /// Number of shards sharing the directory.
    pub shard_count: u32,
    /// Scan, load and classification behavior.
    pub directory: DirectoryConfig,
    /// Compaction and resharding tunables.
    pub compaction: CompactionConfig,
    /// Reshape policy.
    pub reshape: ReshapeConfig,
}

impl Default for SstablesConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/ringdb/data"),
            shard_count: 1,
            directory: DirectoryConfig::default(),
            compaction: CompactionConfig::default(),
            reshape: ReshapeConfig::default(),
        }
    }
}

impl SstablesConfig {
    /// Loads a JSON or TOML file, picked by extension.
    pub fn from_file(path: &Path) -> SstResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| SstError::from_io(path, e))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: SstablesConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| SstError::Config(e.to_string()))?,
            "json" => serde_json::from_str(&contents).map_err(|e| SstError::Config(e.to_string()))?,
            _ => {
                return Err(SstError::Config(format!(
                    "Unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings no directory manager can run with.
    pub fn validate(&self) -> SstResult<()> {
        if self.shard_count == 0 {
            return Err(SstError::Config("shard_count must be at least 1".to_string()));
        }
        if self.directory.load_parallelism == 0 {
            return Err(SstError::Config("directory.load_parallelism must be at least 1".to_string()));
        }
        if self.compaction.max_sstable_bytes == 0 || self.reshape.max_sstable_bytes == 0 {
            return Err(SstError::Config("max_sstable_bytes must be positive".to_string()));
        }
        Ok(())
    }
}
