//! Protocol constants. All monetary values in tarns (1 TARN = 10^8 tarns).

pub const COIN: u64 = 100_000_000;

/// Deepest reorganization the node supports on the fast rewind path.
///
/// The rewind data index retains spent-output entries for the window
/// `[tip - MAX_REORG_LENGTH, tip]`; a reorg deeper than this falls back to
/// reading rewind records straight from the base store.
pub const MAX_REORG_LENGTH: u64 = 500;

/// Number of recent block bodies a pruning node always keeps on disk.
///
/// Bodies within this distance of the UTXO tip are never deleted, so a
/// reorg inside the supported window can always re-read them.
pub const BLOCKS_TO_KEEP: u64 = 288;

/// Seconds between scheduled prune passes.
pub const PRUNE_INTERVAL_SECS: u64 = 10;

/// Maximum number of entries in a block locator.
pub const MAX_LOCATOR_SIZE: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorg_window_covers_keep_window() {
        // Default configuration keeps every body a supported reorg can need.
        assert!(MAX_REORG_LENGTH >= BLOCKS_TO_KEEP);
    }

    #[test]
    fn prune_interval_nonzero() {
        assert!(PRUNE_INTERVAL_SECS > 0);
    }
}
