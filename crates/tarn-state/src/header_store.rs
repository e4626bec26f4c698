//! Durable header-chain store.
//!
//! Persists the active chain as height-keyed `(hash, cumulative work)`
//! records; the linked [`HeaderTree`] is rebuilt on load by walking heights
//! from genesis and linking each record to its predecessor. `save` finds the
//! fork point between the last-saved tip and the current tip with the stored
//! block locator and writes only what changed.

use std::sync::Arc;

use rocksdb::{DB, IteratorMode, WriteBatch};
use tracing::{debug, info, warn};

use tarn_core::chain::HeaderTree;
use tarn_core::error::{HeaderStoreError, TarnError};
use tarn_core::types::{BlockHeader, Hash256, HashHeightPair};

use crate::db::{CF_COMMON, CF_HEADERS, ChainDb, cf_handle, decode_height_key, height_key};

/// Persisted per-height header record.
#[derive(bincode::Encode, bincode::Decode)]
struct HeaderRecord {
    /// Header hash at this height.
    hash: Hash256,
    /// Cumulative work from genesis through this height.
    chain_work: u128,
}

/// Height-keyed store of the active header chain.
pub struct HeaderStore {
    db: Arc<DB>,
}

impl HeaderStore {
    /// Create a store over the shared chain database.
    pub fn new(chain_db: &ChainDb) -> Self {
        Self { db: chain_db.raw() }
    }

    /// Load the header chain, rebuilding the in-memory tree.
    ///
    /// A fresh database is initialized with the genesis record. A gap above
    /// height 0 truncates the loaded chain at the last contiguous height.
    ///
    /// # Errors
    ///
    /// - [`HeaderStoreError::GenesisMissing`] if records exist but height 0 does not
    /// - [`HeaderStoreError::GenesisMismatch`] if the stored genesis differs
    ///   from the network genesis
    /// - [`HeaderStoreError::CorruptRecord`] if the record at height 0 cannot
    ///   be decoded
    pub fn load(&self, genesis: &BlockHeader) -> Result<HeaderTree, TarnError> {
        let cf = cf_handle(&self.db, CF_HEADERS)?;

        let mut records: Vec<(Hash256, u128)> = Vec::new();
        let mut expected = 0u64;
        let mut truncated = false;

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| TarnError::Storage(e.to_string()))?;
            let height = decode_height_key(&key)
                .ok_or_else(|| TarnError::Storage("invalid header key length".into()))?;

            if height != expected {
                if expected == 0 {
                    return Err(HeaderStoreError::GenesisMissing.into());
                }
                warn!(
                    stopped_at = expected - 1,
                    next_stored = height,
                    "gap in header records; truncating loaded chain"
                );
                truncated = true;
                break;
            }

            let record: HeaderRecord =
                match bincode::decode_from_slice(&value, bincode::config::standard()) {
                    Ok((record, _)) => record,
                    Err(_) if height == 0 => {
                        return Err(HeaderStoreError::CorruptRecord { height: 0 }.into());
                    }
                    Err(_) => {
                        warn!(height, "corrupt header record; truncating loaded chain");
                        truncated = true;
                        break;
                    }
                };
            records.push((record.hash, record.chain_work));
            expected += 1;
        }

        if records.is_empty() {
            // Fresh database: seed genesis and its locator.
            let tree = HeaderTree::new(genesis);
            let mut batch = WriteBatch::default();
            self.stage_record(&mut batch, &tree, 0)?;
            self.stage_locator(&mut batch, &tree)?;
            self.db
                .write(batch)
                .map_err(|e| TarnError::Storage(e.to_string()))?;
            info!("initialized header store at genesis");
            return Ok(tree);
        }

        if records[0].0 != genesis.hash() {
            return Err(HeaderStoreError::GenesisMismatch {
                expected: genesis.hash().to_string(),
                got: records[0].0.to_string(),
            }
            .into());
        }

        let tree = HeaderTree::from_records(&records);
        info!(
            height = tree.best().height,
            truncated, "loaded header chain"
        );
        Ok(tree)
    }

    /// Persist the active chain of `tree`.
    ///
    /// Computes the fork point against the last-saved locator, writes the
    /// records above it, deletes stored heights above the new tip, and
    /// refreshes the locator — all in one atomic batch.
    pub fn save(&self, tree: &HeaderTree) -> Result<(), TarnError> {
        let stored_locator = self.stored_locator()?;
        let fork_height = stored_locator
            .iter()
            .flatten()
            .find_map(|pair| {
                (tree.active_hash_at(pair.height) == Some(pair.hash)).then_some(pair.height)
            })
            .unwrap_or(0);
        let stored_tip_height = stored_locator
            .as_ref()
            .and_then(|locator| locator.first())
            .map(|pair| pair.height)
            .unwrap_or(0);

        let tip_height = tree.best().height;
        let mut batch = WriteBatch::default();

        for height in (fork_height + 1)..=tip_height {
            self.stage_record(&mut batch, tree, height)?;
        }
        let cf = cf_handle(&self.db, CF_HEADERS)?;
        for height in (tip_height + 1)..=stored_tip_height {
            batch.delete_cf(cf, height_key(height));
        }
        self.stage_locator(&mut batch, tree)?;

        self.db
            .write(batch)
            .map_err(|e| TarnError::Storage(e.to_string()))?;
        debug!(
            fork_height,
            tip_height,
            written = tip_height.saturating_sub(fork_height),
            "saved header chain"
        );
        Ok(())
    }

    /// The highest stored record, if any.
    pub fn stored_tip(&self) -> Result<Option<HashHeightPair>, TarnError> {
        let cf = cf_handle(&self.db, CF_HEADERS)?;
        match self.db.iterator_cf(&cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, value) = item.map_err(|e| TarnError::Storage(e.to_string()))?;
                let height = decode_height_key(&key)
                    .ok_or_else(|| TarnError::Storage("invalid header key length".into()))?;
                let (record, _): (HeaderRecord, _) =
                    bincode::decode_from_slice(&value, bincode::config::standard())
                        .map_err(|e| TarnError::Storage(e.to_string()))?;
                Ok(Some(HashHeightPair::new(record.hash, height)))
            }
            None => Ok(None),
        }
    }

    // --- Internal helpers ---

    /// Stage the record for `height` on the active chain of `tree`.
    fn stage_record(
        &self,
        batch: &mut WriteBatch,
        tree: &HeaderTree,
        height: u64,
    ) -> Result<(), TarnError> {
        let id = tree
            .ancestor(tree.best_id(), height)
            .ok_or_else(|| TarnError::Storage(format!("no active header at height {height}")))?;
        let node = tree.header(id);
        let record = HeaderRecord {
            hash: node.hash,
            chain_work: node.chain_work,
        };
        let bytes = bincode::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| TarnError::Storage(e.to_string()))?;
        let cf = cf_handle(&self.db, CF_HEADERS)?;
        batch.put_cf(cf, height_key(height), &bytes);
        Ok(())
    }

    /// Stage the locator of the current best chain.
    fn stage_locator(&self, batch: &mut WriteBatch, tree: &HeaderTree) -> Result<(), TarnError> {
        let locator = tree.locator(tree.best_id());
        let bytes = bincode::encode_to_vec(&locator, bincode::config::standard())
            .map_err(|e| TarnError::Storage(e.to_string()))?;
        let cf = cf_handle(&self.db, CF_COMMON)?;
        batch.put_cf(cf, crate::db::KEY_HEADER_LOCATOR, &bytes);
        Ok(())
    }

    /// Read the last-saved locator.
    fn stored_locator(&self) -> Result<Option<Vec<HashHeightPair>>, TarnError> {
        let cf = cf_handle(&self.db, CF_COMMON)?;
        match self
            .db
            .get_cf(&cf, crate::db::KEY_HEADER_LOCATOR)
            .map_err(|e| TarnError::Storage(e.to_string()))?
        {
            Some(bytes) => {
                let (locator, _): (Vec<HashHeightPair>, _) =
                    bincode::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| TarnError::Storage(e.to_string()))?;
                Ok(Some(locator))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_core::error::HeaderStoreError;
    use tarn_core::genesis;

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn temp_store() -> (HeaderStore, ChainDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let chain_db = ChainDb::open(dir.path().join("chaindata")).unwrap();
        (HeaderStore::new(&chain_db), chain_db, dir)
    }

    fn make_header(prev_hash: Hash256, salt: u64) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: Hash256::ZERO,
            timestamp: genesis::GENESIS_TIMESTAMP + salt,
            difficulty_target: u64::MAX,
            nonce: salt,
        }
    }

    fn make_heavy_header(prev_hash: Hash256, salt: u64) -> BlockHeader {
        BlockHeader {
            difficulty_target: u64::MAX / 1024,
            ..make_header(prev_hash, salt)
        }
    }

    /// Extend the tree's best chain by `count` headers.
    fn extend(tree: &mut HeaderTree, count: u64) {
        for i in 0..count {
            let prev = tree.best().hash;
            tree.insert(&make_header(prev, 1000 + i)).unwrap();
        }
    }

    /// Delete the stored record at `height` directly.
    fn delete_record(store: &HeaderStore, height: u64) {
        let cf = cf_handle(&store.db, CF_HEADERS).unwrap();
        store.db.delete_cf(&cf, height_key(height)).unwrap();
    }

    // ------------------------------------------------------------------
    // Fresh load
    // ------------------------------------------------------------------

    #[test]
    fn fresh_load_initializes_genesis() {
        let (store, _db, _dir) = temp_store();
        let tree = store.load(genesis::genesis_header()).unwrap();
        assert_eq!(tree.tip_pair(), genesis::genesis_pair());
        assert_eq!(store.stored_tip().unwrap(), Some(genesis::genesis_pair()));
    }

    #[test]
    fn fresh_load_is_idempotent() {
        let (store, _db, _dir) = temp_store();
        store.load(genesis::genesis_header()).unwrap();
        let tree = store.load(genesis::genesis_header()).unwrap();
        assert_eq!(tree.len(), 1);
    }

    // ------------------------------------------------------------------
    // Save / load round trip
    // ------------------------------------------------------------------

    #[test]
    fn save_load_roundtrip() {
        let (store, _db, _dir) = temp_store();
        let mut tree = store.load(genesis::genesis_header()).unwrap();
        extend(&mut tree, 10);
        store.save(&tree).unwrap();

        let reloaded = store.load(genesis::genesis_header()).unwrap();
        assert_eq!(reloaded.tip_pair(), tree.tip_pair());
        assert_eq!(reloaded.best().chain_work, tree.best().chain_work);
        for height in 0..=10 {
            assert_eq!(
                reloaded.active_hash_at(height),
                tree.active_hash_at(height),
                "height {height}"
            );
        }
    }

    #[test]
    fn incremental_save_writes_only_above_fork() {
        let (store, _db, _dir) = temp_store();
        let mut tree = store.load(genesis::genesis_header()).unwrap();
        extend(&mut tree, 5);
        store.save(&tree).unwrap();

        // Punch a hole below the saved tip. An incremental save must not
        // repair it, because it only writes above the fork point.
        delete_record(&store, 3);

        extend(&mut tree, 3);
        store.save(&tree).unwrap();

        assert_eq!(store.stored_tip().unwrap().unwrap().height, 8);
        // Loading truncates at the gap, proving heights <= 5 were untouched.
        let reloaded = store.load(genesis::genesis_header()).unwrap();
        assert_eq!(reloaded.best().height, 2);
    }

    #[test]
    fn save_after_reorg_deletes_stale_heights() {
        let (store, _db, _dir) = temp_store();
        let mut tree = store.load(genesis::genesis_header()).unwrap();
        extend(&mut tree, 5);
        store.save(&tree).unwrap();

        // Heavier branch forking at height 2, tip at height 3.
        let fork_hash = tree.active_hash_at(2).unwrap();
        let heavy = make_heavy_header(fork_hash, 77);
        tree.insert(&heavy).unwrap();
        assert_eq!(tree.best().height, 3);

        store.save(&tree).unwrap();
        assert_eq!(store.stored_tip().unwrap().unwrap().height, 3);

        let reloaded = store.load(genesis::genesis_header()).unwrap();
        assert_eq!(reloaded.best().height, 3);
        assert_eq!(reloaded.best().hash, heavy.hash());
    }

    // ------------------------------------------------------------------
    // Failure semantics
    // ------------------------------------------------------------------

    #[test]
    fn missing_genesis_record_is_fatal() {
        let (store, _db, _dir) = temp_store();
        let mut tree = store.load(genesis::genesis_header()).unwrap();
        extend(&mut tree, 3);
        store.save(&tree).unwrap();

        delete_record(&store, 0);
        let err = store.load(genesis::genesis_header()).unwrap_err();
        assert!(matches!(
            err,
            TarnError::HeaderStore(HeaderStoreError::GenesisMissing)
        ));
    }

    #[test]
    fn wrong_genesis_is_fatal() {
        let (store, _db, _dir) = temp_store();
        store.load(genesis::genesis_header()).unwrap();

        let other_genesis = make_header(Hash256::ZERO, 999);
        let err = store.load(&other_genesis).unwrap_err();
        assert!(matches!(
            err,
            TarnError::HeaderStore(HeaderStoreError::GenesisMismatch { .. })
        ));
    }

    #[test]
    fn gap_truncates_loaded_chain() {
        let (store, _db, _dir) = temp_store();
        let mut tree = store.load(genesis::genesis_header()).unwrap();
        extend(&mut tree, 6);
        store.save(&tree).unwrap();

        delete_record(&store, 4);
        let reloaded = store.load(genesis::genesis_header()).unwrap();
        assert_eq!(reloaded.best().height, 3);
    }
}
