//! Chain-state engine configuration.
//!
//! Provides [`StateConfig`] with defaults for the data directory, the reorg
//! window, and pruning. The configuration is customized programmatically or
//! from CLI flags in the node binary.

use std::path::PathBuf;
use std::time::Duration;

use tarn_core::constants::{BLOCKS_TO_KEEP, MAX_REORG_LENGTH, PRUNE_INTERVAL_SECS};

/// Configuration for a chain-state engine instance.
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Deepest reorg served by the fast rewind path.
    pub max_reorg_length: u64,
    /// Number of recent block bodies kept when pruning.
    pub blocks_to_keep: u64,
    /// Seconds between scheduled prune passes.
    pub prune_interval_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tarn");

        Self {
            data_dir,
            max_reorg_length: MAX_REORG_LENGTH,
            blocks_to_keep: BLOCKS_TO_KEEP,
            prune_interval_secs: PRUNE_INTERVAL_SECS,
        }
    }
}

impl StateConfig {
    /// Path to the RocksDB chain data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chaindata")
    }

    /// Prune pass interval as a [`Duration`].
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_windows_match_constants() {
        let cfg = StateConfig::default();
        assert_eq!(cfg.max_reorg_length, MAX_REORG_LENGTH);
        assert_eq!(cfg.blocks_to_keep, BLOCKS_TO_KEEP);
        assert_eq!(cfg.prune_interval_secs, PRUNE_INTERVAL_SECS);
    }

    #[test]
    fn default_data_dir_ends_with_tarn() {
        let cfg = StateConfig::default();
        assert!(
            cfg.data_dir.ends_with("tarn"),
            "data_dir should end with 'tarn': {:?}",
            cfg.data_dir
        );
    }

    #[test]
    fn db_path_appends_chaindata() {
        let cfg = StateConfig {
            data_dir: PathBuf::from("/tmp/tarn-test"),
            ..StateConfig::default()
        };
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/tarn-test/chaindata"));
    }

    #[test]
    fn prune_interval_conversion() {
        let cfg = StateConfig {
            prune_interval_secs: 25,
            ..StateConfig::default()
        };
        assert_eq!(cfg.prune_interval(), Duration::from_secs(25));
    }

    #[test]
    fn config_is_clone_and_debug() {
        let cfg = StateConfig::default();
        let cfg2 = cfg.clone();
        assert!(format!("{cfg2:?}").contains("StateConfig"));
    }
}
