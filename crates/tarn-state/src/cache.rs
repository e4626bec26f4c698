//! Write-back coin cache in front of the base store.
//!
//! Answers reads from an in-memory overlay, stages each connected block's
//! coin delta and rewind record, and hits disk only on [`flush`]. Block
//! connection and rewind are mutually exclusive writer operations; the
//! entry map sits behind its own mutex so concurrent readers can still
//! cache base-store lookups while no writer is active.
//!
//! A crash before `flush` loses only staged state: on restart the engine's
//! initialize loop reconciles the persisted tip against the header chain,
//! so a missed flush is corrected rather than special-cased.
//!
//! [`flush`]: CoinViewCache::flush

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, trace};

use tarn_core::error::{ChainStateError, TarnError};
use tarn_core::traits::CoinView;
use tarn_core::types::{Coin, CoinStatus, HashHeightPair, OutPoint, RewindData};

use crate::coin_store::{CoinStore, FlushChanges};
use crate::rewind_index::RewindDataIndex;

/// One cached outpoint.
///
/// `coin: None` with `dirty` set is a staged spend (tombstone); with `dirty`
/// clear it is a negative cache of a base-store miss.
struct CacheEntry {
    coin: Option<Coin>,
    dirty: bool,
}

/// In-memory write-back overlay over a [`CoinStore`].
pub struct CoinViewCache {
    store: CoinStore,
    entries: Mutex<HashMap<OutPoint, CacheEntry>>,
    /// Rewind records staged since the last flush, ascending by height.
    staged_rewinds: Vec<(u64, RewindData)>,
    rewind_index: RewindDataIndex,
    tip: HashHeightPair,
    tip_dirty: bool,
}

impl CoinViewCache {
    /// Create a cache over the base store, adopting its persisted tip.
    pub fn new(store: CoinStore, max_reorg_length: u64) -> Result<Self, TarnError> {
        let tip = store.tip()?;
        Ok(Self {
            store,
            entries: Mutex::new(HashMap::new()),
            staged_rewinds: Vec::new(),
            rewind_index: RewindDataIndex::new(max_reorg_length),
            tip,
            tip_dirty: false,
        })
    }

    /// Bulk-populate the rewind index at the current tip.
    ///
    /// Reads rewind records through this view (staged first, base store
    /// otherwise) so an index rebuild mid-session stays consistent with
    /// unflushed blocks.
    pub fn initialize_index(&mut self) -> Result<(), TarnError> {
        let tip_height = self.tip.height;
        let floor = tip_height.saturating_sub(self.rewind_index.max_reorg_length());

        let mut records: Vec<(u64, Vec<OutPoint>)> = Vec::new();
        for height in floor..=tip_height {
            if let Some(rewind) = CoinView::rewind_data(self, height)? {
                records.push((height, rewind.spent_outpoints()));
            }
        }
        self.rewind_index.rebuild(tip_height, floor, records);
        Ok(())
    }

    /// Read access to the rewind index (floor checks, diagnostics).
    pub fn rewind_index(&self) -> &RewindDataIndex {
        &self.rewind_index
    }

    /// Current tip of this view, including staged (unflushed) blocks.
    pub fn tip(&self) -> HashHeightPair {
        self.tip.clone()
    }

    /// Look up a batch of outpoints: dirty set first, then the base store,
    /// caching whatever the base answers.
    pub fn fetch_coins(
        &self,
        outpoints: &[OutPoint],
    ) -> Result<Vec<(OutPoint, CoinStatus)>, TarnError> {
        let mut entries = self.entries.lock();
        let mut result = Vec::with_capacity(outpoints.len());

        for outpoint in outpoints {
            let status = match entries.get(outpoint) {
                Some(entry) => match &entry.coin {
                    Some(coin) => CoinStatus::Unspent(coin.clone()),
                    None if entry.dirty => CoinStatus::Spent,
                    None => CoinStatus::Unknown,
                },
                None => {
                    let fetched = self.store.fetch_coin(outpoint)?;
                    let status = match &fetched {
                        Some(coin) => CoinStatus::Unspent(coin.clone()),
                        None => CoinStatus::Unknown,
                    };
                    entries.insert(
                        outpoint.clone(),
                        CacheEntry {
                            coin: fetched,
                            dirty: false,
                        },
                    );
                    status
                }
            };
            result.push((outpoint.clone(), status));
        }
        Ok(result)
    }

    /// Stage one block's coin delta and rewind record.
    ///
    /// Does not touch disk; the delta lands in the base store on the next
    /// [`flush`](Self::flush).
    ///
    /// # Errors
    ///
    /// [`ChainStateError::HeightMismatch`] if `new_tip.height` is not exactly
    /// one above the current tip — a programming error in the caller, never
    /// silently accepted.
    pub fn save_changes(
        &mut self,
        new_tip: HashHeightPair,
        spent: &[OutPoint],
        created: &[(OutPoint, Coin)],
        rewind: RewindData,
    ) -> Result<(), TarnError> {
        if new_tip.height != self.tip.height + 1 {
            return Err(ChainStateError::HeightMismatch {
                expected: self.tip.height + 1,
                got: new_tip.height,
            }
            .into());
        }

        {
            let mut entries = self.entries.lock();
            for outpoint in spent {
                entries.insert(
                    outpoint.clone(),
                    CacheEntry {
                        coin: None,
                        dirty: true,
                    },
                );
            }
            for (outpoint, coin) in created {
                entries.insert(
                    outpoint.clone(),
                    CacheEntry {
                        coin: Some(coin.clone()),
                        dirty: true,
                    },
                );
            }
        }

        self.staged_rewinds.push((new_tip.height, rewind));
        self.rewind_index.save_and_evict(new_tip.height, Some(spent));

        trace!(
            tip = %new_tip,
            spent = spent.len(),
            created = created.len(),
            "staged block changes"
        );
        self.tip = new_tip;
        self.tip_dirty = true;
        Ok(())
    }

    /// Undo the block at the current tip and return the previous tip.
    ///
    /// Re-inserts the coins the block spent, deletes the outpoints it
    /// created, decrements the tip, and keeps the rewind index consistent.
    /// Reads the rewind record from the staged set when the block was never
    /// flushed, from the base store otherwise.
    ///
    /// # Errors
    ///
    /// - [`ChainStateError::RewindAtGenesis`] at height 0
    /// - [`ChainStateError::RewindDataMissing`] if the record is gone (pruned
    ///   past the reorg window or corrupt store)
    pub fn rewind(&mut self) -> Result<HashHeightPair, TarnError> {
        if self.tip.height == 0 {
            return Err(ChainStateError::RewindAtGenesis.into());
        }
        let height = self.tip.height;

        let rewind = match self.staged_rewinds.last() {
            Some((staged_height, _)) if *staged_height == height => {
                self.staged_rewinds.pop().map(|(_, rd)| rd).unwrap_or_default()
            }
            _ => self
                .store
                .rewind_data(height)?
                .ok_or(ChainStateError::RewindDataMissing(height))?,
        };

        {
            let mut entries = self.entries.lock();
            for outpoint in &rewind.created_outpoints {
                entries.insert(
                    outpoint.clone(),
                    CacheEntry {
                        coin: None,
                        dirty: true,
                    },
                );
            }
            for (outpoint, coin) in &rewind.spent_coins {
                entries.insert(
                    outpoint.clone(),
                    CacheEntry {
                        coin: Some(coin.clone()),
                        dirty: true,
                    },
                );
            }
        }

        self.rewind_index.remove(height, &self.store)?;

        let previous = HashHeightPair::new(rewind.previous_tip, height - 1);
        debug!(from = %self.tip, to = %previous, "rewound block");
        self.tip = previous.clone();
        self.tip_dirty = true;
        Ok(previous)
    }

    /// Force all staged changes to the base store in one atomic batch.
    ///
    /// Idempotent: a second flush with nothing staged writes nothing. Must
    /// run before shutdown or the staged blocks are lost and re-derived on
    /// the next start.
    pub fn flush(&mut self) -> Result<(), TarnError> {
        if !self.tip_dirty && self.staged_rewinds.is_empty() {
            return Ok(());
        }

        let mut entries = self.entries.lock();
        let mut insert: Vec<(OutPoint, Coin)> = Vec::new();
        let mut delete: Vec<OutPoint> = Vec::new();
        for (outpoint, entry) in entries.iter() {
            if !entry.dirty {
                continue;
            }
            match &entry.coin {
                Some(coin) => insert.push((outpoint.clone(), coin.clone())),
                None => delete.push(outpoint.clone()),
            }
        }

        self.store.persist(FlushChanges {
            insert: &insert,
            delete: &delete,
            rewind: &self.staged_rewinds,
            tip: &self.tip,
        })?;

        // Tombstones and negative caches are dropped; surviving coins stay
        // cached and clean.
        entries.retain(|_, entry| entry.coin.is_some());
        for entry in entries.values_mut() {
            entry.dirty = false;
        }
        drop(entries);

        debug!(
            inserted = insert.len(),
            deleted = delete.len(),
            rewind_records = self.staged_rewinds.len(),
            tip = %self.tip,
            "flushed coin cache"
        );
        self.staged_rewinds.clear();
        self.tip_dirty = false;
        Ok(())
    }

    /// Number of staged (unflushed) blocks. Diagnostics helper.
    pub fn staged_blocks(&self) -> usize {
        self.staged_rewinds.len()
    }
}

impl CoinView for CoinViewCache {
    fn fetch_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, TarnError> {
        let statuses = self.fetch_coins(std::slice::from_ref(outpoint))?;
        Ok(statuses
            .into_iter()
            .next()
            .and_then(|(_, status)| status.coin().cloned()))
    }

    fn rewind_data(&self, height: u64) -> Result<Option<RewindData>, TarnError> {
        for (staged_height, rewind) in self.staged_rewinds.iter().rev() {
            if *staged_height == height {
                return Ok(Some(rewind.clone()));
            }
        }
        self.store.rewind_data(height)
    }

    fn tip(&self) -> Result<HashHeightPair, TarnError> {
        Ok(self.tip.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tarn_core::constants::COIN;
    use tarn_core::genesis;
    use tarn_core::types::Hash256;

    use crate::db::ChainDb;

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    const MAX_REORG: u64 = 10;

    fn temp_cache() -> (CoinViewCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let chain_db = ChainDb::open(dir.path().join("chaindata")).unwrap();
        let store = CoinStore::new(&chain_db);
        store.ensure_initialized(genesis::genesis_pair()).unwrap();
        (CoinViewCache::new(store, MAX_REORG).unwrap(), dir)
    }

    fn op(seed: u8, index: u64) -> OutPoint {
        OutPoint {
            txid: Hash256([seed; 32]),
            index,
        }
    }

    fn coin(value: u64, height: u64) -> Coin {
        Coin {
            value,
            script_pubkey: vec![0x51, 0x52],
            is_coinbase: false,
            height,
        }
    }

    fn block_hash(height: u64) -> Hash256 {
        let mut bytes = [0xB0u8; 32];
        bytes[..8].copy_from_slice(&height.to_le_bytes());
        Hash256(bytes)
    }

    /// Stage a block at `height` creating `created` and spending `spent`.
    fn connect(
        cache: &mut CoinViewCache,
        height: u64,
        spent: &[(OutPoint, Coin)],
        created: &[(OutPoint, Coin)],
    ) {
        let previous_tip = cache.tip().hash;
        let rewind = RewindData::new(
            previous_tip,
            spent.to_vec(),
            created.iter().map(|(op, _)| op.clone()).collect(),
        );
        let spent_ops: Vec<OutPoint> = spent.iter().map(|(op, _)| op.clone()).collect();
        cache
            .save_changes(
                HashHeightPair::new(block_hash(height), height),
                &spent_ops,
                created,
                rewind,
            )
            .unwrap();
    }

    // ------------------------------------------------------------------
    // Fetch
    // ------------------------------------------------------------------

    #[test]
    fn fresh_cache_adopts_store_tip() {
        let (cache, _dir) = temp_cache();
        assert_eq!(cache.tip(), genesis::genesis_pair());
        assert_eq!(cache.staged_blocks(), 0);
    }

    #[test]
    fn unknown_outpoint_is_unknown() {
        let (cache, _dir) = temp_cache();
        let statuses = cache.fetch_coins(&[op(1, 0)]).unwrap();
        assert_eq!(statuses[0].1, CoinStatus::Unknown);
    }

    #[test]
    fn created_coin_is_unspent_before_flush() {
        let (mut cache, _dir) = temp_cache();
        let out = op(1, 0);
        connect(&mut cache, 1, &[], &[(out.clone(), coin(50 * COIN, 1))]);

        let statuses = cache.fetch_coins(std::slice::from_ref(&out)).unwrap();
        assert_eq!(statuses[0].1, CoinStatus::Unspent(coin(50 * COIN, 1)));
    }

    #[test]
    fn spent_coin_reports_spent_before_flush() {
        let (mut cache, _dir) = temp_cache();
        let out = op(1, 0);
        connect(&mut cache, 1, &[], &[(out.clone(), coin(50 * COIN, 1))]);
        connect(&mut cache, 2, &[(out.clone(), coin(50 * COIN, 1))], &[]);

        let statuses = cache.fetch_coins(std::slice::from_ref(&out)).unwrap();
        assert_eq!(statuses[0].1, CoinStatus::Spent);
    }

    #[test]
    fn fetch_reads_through_to_base_store() {
        let dir = tempfile::tempdir().unwrap();
        let chain_db = ChainDb::open(dir.path().join("chaindata")).unwrap();
        let store = CoinStore::new(&chain_db);
        store.ensure_initialized(genesis::genesis_pair()).unwrap();

        let mut cache = CoinViewCache::new(store, MAX_REORG).unwrap();
        let out = op(1, 0);
        connect(&mut cache, 1, &[], &[(out.clone(), coin(7, 1))]);
        cache.flush().unwrap();

        // A fresh cache over the same database sees the flushed coin.
        let fresh = CoinViewCache::new(CoinStore::new(&chain_db), MAX_REORG).unwrap();
        assert_eq!(fresh.tip().height, 1);
        let statuses = fresh.fetch_coins(std::slice::from_ref(&out)).unwrap();
        assert_eq!(statuses[0].1, CoinStatus::Unspent(coin(7, 1)));
    }

    #[test]
    fn fetch_batch_mixes_statuses() {
        let (mut cache, _dir) = temp_cache();
        let created = op(1, 0);
        let spent = op(2, 0);
        connect(
            &mut cache,
            1,
            &[],
            &[(created.clone(), coin(1, 1)), (spent.clone(), coin(2, 1))],
        );
        connect(&mut cache, 2, &[(spent.clone(), coin(2, 1))], &[]);

        let statuses = cache
            .fetch_coins(&[created.clone(), spent.clone(), op(9, 9)])
            .unwrap();
        assert_eq!(statuses[0].1, CoinStatus::Unspent(coin(1, 1)));
        assert_eq!(statuses[1].1, CoinStatus::Spent);
        assert_eq!(statuses[2].1, CoinStatus::Unknown);
    }

    // ------------------------------------------------------------------
    // save_changes
    // ------------------------------------------------------------------

    #[test]
    fn save_changes_rejects_height_gap() {
        let (mut cache, _dir) = temp_cache();
        let err = cache
            .save_changes(
                HashHeightPair::new(block_hash(5), 5),
                &[],
                &[],
                RewindData::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            TarnError::ChainState(ChainStateError::HeightMismatch { expected: 1, got: 5 })
        ));
    }

    #[test]
    fn save_changes_rejects_same_height() {
        let (mut cache, _dir) = temp_cache();
        connect(&mut cache, 1, &[], &[(op(1, 0), coin(1, 1))]);
        let err = cache
            .save_changes(
                HashHeightPair::new(block_hash(1), 1),
                &[],
                &[],
                RewindData::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            TarnError::ChainState(ChainStateError::HeightMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn save_changes_updates_rewind_index() {
        let (mut cache, _dir) = temp_cache();
        let out = op(1, 0);
        connect(&mut cache, 1, &[], &[(out.clone(), coin(1, 1))]);
        connect(&mut cache, 2, &[(out.clone(), coin(1, 1))], &[]);

        assert_eq!(cache.rewind_index().get(&out), Some(2));
    }

    // ------------------------------------------------------------------
    // Rewind
    // ------------------------------------------------------------------

    #[test]
    fn rewind_at_genesis_errors() {
        let (mut cache, _dir) = temp_cache();
        let err = cache.rewind().unwrap_err();
        assert!(matches!(
            err,
            TarnError::ChainState(ChainStateError::RewindAtGenesis)
        ));
    }

    #[test]
    fn save_then_rewind_restores_state() {
        let (mut cache, _dir) = temp_cache();
        let base = op(1, 0);
        connect(&mut cache, 1, &[], &[(base.clone(), coin(50 * COIN, 1))]);
        let tip_before = cache.tip();

        let child = op(2, 0);
        connect(
            &mut cache,
            2,
            &[(base.clone(), coin(50 * COIN, 1))],
            &[(child.clone(), coin(49 * COIN, 2))],
        );

        let previous = cache.rewind().unwrap();
        assert_eq!(previous, tip_before);
        assert_eq!(cache.tip(), tip_before);

        // The spent coin is back; the created one is gone.
        let statuses = cache.fetch_coins(&[base, child]).unwrap();
        assert_eq!(statuses[0].1, CoinStatus::Unspent(coin(50 * COIN, 1)));
        assert!(matches!(
            statuses[1].1,
            CoinStatus::Spent | CoinStatus::Unknown
        ));
    }

    #[test]
    fn rewind_uses_staged_record_without_flush() {
        let (mut cache, _dir) = temp_cache();
        connect(&mut cache, 1, &[], &[(op(1, 0), coin(1, 1))]);
        assert_eq!(cache.staged_blocks(), 1);

        cache.rewind().unwrap();
        assert_eq!(cache.staged_blocks(), 0);
        assert_eq!(cache.tip(), genesis::genesis_pair());
    }

    #[test]
    fn rewind_reads_base_store_after_flush() {
        let (mut cache, _dir) = temp_cache();
        let out = op(1, 0);
        connect(&mut cache, 1, &[], &[(out.clone(), coin(5, 1))]);
        connect(&mut cache, 2, &[(out.clone(), coin(5, 1))], &[]);
        cache.flush().unwrap();
        assert_eq!(cache.staged_blocks(), 0);

        cache.rewind().unwrap();
        assert_eq!(cache.tip().height, 1);
        let statuses = cache.fetch_coins(std::slice::from_ref(&out)).unwrap();
        assert_eq!(statuses[0].1, CoinStatus::Unspent(coin(5, 1)));
    }

    #[test]
    fn rewind_missing_record_errors() {
        let (mut cache, _dir) = temp_cache();
        connect(&mut cache, 1, &[], &[(op(1, 0), coin(1, 1))]);
        cache.flush().unwrap();
        cache.store.prune_rewind_records(1).unwrap();

        let err = cache.rewind().unwrap_err();
        assert!(matches!(
            err,
            TarnError::ChainState(ChainStateError::RewindDataMissing(1))
        ));
    }

    #[test]
    fn rewind_removes_index_entries() {
        let (mut cache, _dir) = temp_cache();
        let out = op(1, 0);
        connect(&mut cache, 1, &[], &[(out.clone(), coin(1, 1))]);
        connect(&mut cache, 2, &[(out.clone(), coin(1, 1))], &[]);
        assert_eq!(cache.rewind_index().get(&out), Some(2));

        cache.rewind().unwrap();
        assert_eq!(cache.rewind_index().get(&out), None);
    }

    // ------------------------------------------------------------------
    // Flush
    // ------------------------------------------------------------------

    #[test]
    fn flush_persists_staged_state() {
        let (mut cache, _dir) = temp_cache();
        let out = op(1, 0);
        connect(&mut cache, 1, &[], &[(out.clone(), coin(3, 1))]);
        cache.flush().unwrap();

        assert_eq!(cache.store.tip().unwrap().height, 1);
        assert_eq!(cache.store.fetch_coin(&out).unwrap(), Some(coin(3, 1)));
        assert!(cache.store.rewind_data(1).unwrap().is_some());
    }

    #[test]
    fn flush_applies_spends_to_base() {
        let (mut cache, _dir) = temp_cache();
        let out = op(1, 0);
        connect(&mut cache, 1, &[], &[(out.clone(), coin(3, 1))]);
        cache.flush().unwrap();

        connect(&mut cache, 2, &[(out.clone(), coin(3, 1))], &[]);
        cache.flush().unwrap();

        assert_eq!(cache.store.fetch_coin(&out).unwrap(), None);
        assert_eq!(cache.store.tip().unwrap().height, 2);
    }

    #[test]
    fn flush_twice_is_idempotent() {
        let (mut cache, _dir) = temp_cache();
        connect(&mut cache, 1, &[], &[(op(1, 0), coin(3, 1))]);
        cache.flush().unwrap();
        cache.flush().unwrap();
        assert_eq!(cache.store.tip().unwrap().height, 1);
        assert_eq!(cache.staged_blocks(), 0);
    }

    #[test]
    fn flush_after_rewind_persists_restored_state() {
        let (mut cache, _dir) = temp_cache();
        let out = op(1, 0);
        connect(&mut cache, 1, &[], &[(out.clone(), coin(5, 1))]);
        connect(&mut cache, 2, &[(out.clone(), coin(5, 1))], &[]);
        cache.flush().unwrap();

        cache.rewind().unwrap();
        cache.flush().unwrap();

        assert_eq!(cache.store.tip().unwrap().height, 1);
        assert_eq!(cache.store.fetch_coin(&out).unwrap(), Some(coin(5, 1)));
    }

    // ------------------------------------------------------------------
    // Round-trip property
    // ------------------------------------------------------------------

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Connecting N blocks and rewinding N times restores the exact
        /// starting tip and coin set, flushed or not.
        #[test]
        fn connect_rewind_roundtrip(
            blocks in 1usize..8,
            spends_per_block in 0usize..3,
            flush_midway in any::<bool>(),
        ) {
            let (mut cache, _dir) = temp_cache();

            // Seed a funding block whose coins later blocks spend.
            let funding: Vec<(OutPoint, Coin)> = (0..16)
                .map(|i| (op(0xF0, i as u64), coin(1 + i as u64, 1)))
                .collect();
            connect(&mut cache, 1, &[], &funding);
            cache.flush().unwrap();
            let baseline_tip = cache.tip();

            let mut available = funding.clone();
            for b in 0..blocks {
                let height = 2 + b as u64;
                let spent: Vec<(OutPoint, Coin)> = available
                    .drain(..spends_per_block.min(available.len()))
                    .collect();
                let created = vec![(op(0x10 + b as u8, 0), coin(100 + b as u64, height))];
                connect(&mut cache, height, &spent, &created);
                if flush_midway && b == blocks / 2 {
                    cache.flush().unwrap();
                }
            }

            for _ in 0..blocks {
                cache.rewind().unwrap();
            }
            cache.flush().unwrap();

            prop_assert_eq!(cache.tip(), baseline_tip);
            // Every funding coin is unspent again; every created coin is gone.
            for (outpoint, expected) in &funding {
                prop_assert_eq!(cache.store.fetch_coin(outpoint).unwrap().as_ref(), Some(expected));
            }
            for b in 0..blocks {
                prop_assert_eq!(cache.store.fetch_coin(&op(0x10 + b as u8, 0)).unwrap(), None);
            }
            prop_assert_eq!(cache.store.coin_count().unwrap(), funding.len() as u64);
        }
    }
}
