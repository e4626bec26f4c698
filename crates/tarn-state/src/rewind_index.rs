//! Sliding-window index of recently spent outpoints.
//!
//! Maps each outpoint spent within the last `max_reorg_length` blocks to the
//! height that spent it, so a rewind can find the coins to restore without
//! scanning the base store. The index is a performance path only: every
//! entry can be re-derived from the authoritative rewind records in the
//! base store, and any miss falls back to them.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use tarn_core::error::TarnError;
use tarn_core::traits::CoinView;
use tarn_core::types::OutPoint;

/// Outpoint → spend-height index bounded to a reorg-depth window.
///
/// Invariant: an entry exists for an outpoint iff that outpoint was spent at
/// a height within `[tip - max_reorg_length, tip]`.
pub struct RewindDataIndex {
    max_reorg_length: u64,
    by_outpoint: HashMap<OutPoint, u64>,
    by_height: BTreeMap<u64, Vec<OutPoint>>,
}

impl RewindDataIndex {
    /// Create an empty index with the given retention window.
    pub fn new(max_reorg_length: u64) -> Self {
        Self {
            max_reorg_length,
            by_outpoint: HashMap::new(),
            by_height: BTreeMap::new(),
        }
    }

    /// The retention window length.
    pub fn max_reorg_length(&self) -> u64 {
        self.max_reorg_length
    }

    /// Bulk-populate from a view's rewind records, reading from
    /// `tip_height` down to `max(0, tip_height - max_reorg_length)`.
    ///
    /// The bound keeps memory proportional to the supported reorg depth
    /// rather than chain length; a reorg deeper than the window cannot use
    /// this fast path and reads rewind records from the store directly.
    pub fn initialize(&mut self, tip_height: u64, view: &dyn CoinView) -> Result<(), TarnError> {
        let floor = tip_height.saturating_sub(self.max_reorg_length);
        let mut records: Vec<(u64, Vec<OutPoint>)> = Vec::new();
        for height in floor..=tip_height {
            if let Some(rewind) = view.rewind_data(height)? {
                records.push((height, rewind.spent_outpoints()));
            }
        }
        self.rebuild(tip_height, floor, records);
        Ok(())
    }

    /// Replace the contents with pre-collected spends per height.
    pub(crate) fn rebuild(
        &mut self,
        tip_height: u64,
        floor: u64,
        records: Vec<(u64, Vec<OutPoint>)>,
    ) {
        self.by_outpoint.clear();
        self.by_height.clear();
        for (height, spends) in records {
            for outpoint in spends {
                self.insert_entry(outpoint, height);
            }
        }
        debug!(
            tip_height,
            floor,
            entries = self.len(),
            "initialized rewind data index"
        );
    }

    /// Record the spends of a newly connected block, then evict everything
    /// that has slid out of the window.
    ///
    /// `None` spends performs only the eviction pass (an explicit compact).
    pub fn save_and_evict(&mut self, new_height: u64, new_spends: Option<&[OutPoint]>) {
        if let Some(spends) = new_spends {
            for outpoint in spends {
                self.insert_entry(outpoint.clone(), new_height);
            }
        }

        let evict: Vec<u64> = self
            .by_height
            .keys()
            .take_while(|height| **height + self.max_reorg_length < new_height)
            .copied()
            .collect();
        for height in evict {
            self.remove_bucket(height);
        }
    }

    /// Drop all entries recorded at `height` (the block being undone) and
    /// backfill the bottom of the window from the view's rewind records so
    /// the window invariant holds for the new, lower tip.
    pub fn remove(&mut self, height: u64, view: &dyn CoinView) -> Result<(), TarnError> {
        self.remove_bucket(height);

        let new_tip = height.saturating_sub(1);
        let floor = new_tip.saturating_sub(self.max_reorg_length);
        let fill_until = self
            .by_height
            .keys()
            .next()
            .copied()
            .unwrap_or(new_tip + 1);

        for backfill_height in floor..fill_until {
            if let Some(rewind) = view.rewind_data(backfill_height)? {
                for (outpoint, _) in rewind.spent_coins {
                    self.insert_entry(outpoint, backfill_height);
                }
            }
        }
        trace!(height, entries = self.len(), "removed rewind index entries");
        Ok(())
    }

    /// Height at which `outpoint` was spent, if inside the window.
    pub fn get(&self, outpoint: &OutPoint) -> Option<u64> {
        self.by_outpoint.get(outpoint).copied()
    }

    /// Number of tracked outpoints.
    pub fn len(&self) -> usize {
        self.by_outpoint.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.by_outpoint.is_empty()
    }

    /// Lowest height with entries, if any.
    pub fn lowest_height(&self) -> Option<u64> {
        self.by_height.keys().next().copied()
    }

    // --- Internal helpers ---

    /// Insert one entry. A duplicate outpoint silently takes the newer
    /// height: the index is not a source of truth, so this is a defensive
    /// no-op rather than an error.
    fn insert_entry(&mut self, outpoint: OutPoint, height: u64) {
        if let Some(old) = self.by_outpoint.insert(outpoint.clone(), height) {
            if old == height {
                return;
            }
            if let Some(bucket) = self.by_height.get_mut(&old) {
                bucket.retain(|op| op != &outpoint);
                if bucket.is_empty() {
                    self.by_height.remove(&old);
                }
            }
        }
        self.by_height.entry(height).or_default().push(outpoint);
    }

    /// Remove a whole height bucket.
    fn remove_bucket(&mut self, height: u64) {
        if let Some(bucket) = self.by_height.remove(&height) {
            for outpoint in bucket {
                if self.by_outpoint.get(&outpoint) == Some(&height) {
                    self.by_outpoint.remove(&outpoint);
                }
            }
        }
    }
}
