//! Base UTXO store: coins, rewind records, and the persisted tip marker.
//!
//! This is the durable layer below the write-back cache. Coins are keyed by
//! outpoint, rewind records by height, and the tip marker lives in the
//! common column family. A whole cache flush lands in a single atomic
//! [`WriteBatch`], so a crash either sees the previous tip with the previous
//! coin set or the new tip with the new one.

use std::sync::Arc;

use rocksdb::{DB, IteratorMode, WriteBatch};
use tracing::debug;

use tarn_core::error::TarnError;
use tarn_core::traits::CoinView;
use tarn_core::types::{Coin, HashHeightPair, OutPoint, RewindData};

use crate::db::{
    CF_COINS, CF_COMMON, CF_REWIND, ChainDb, KEY_UTXO_TIP, cf_handle, decode_height_key,
    height_key,
};

/// One flush worth of staged changes, applied atomically.
pub struct FlushChanges<'a> {
    /// Coins to insert (created since the last flush).
    pub insert: &'a [(OutPoint, Coin)],
    /// Outpoints to delete (spent since the last flush).
    pub delete: &'a [OutPoint],
    /// Rewind records to append, one per block connected since the last flush.
    pub rewind: &'a [(u64, RewindData)],
    /// The tip the store ends up at.
    pub tip: &'a HashHeightPair,
}

/// Durable outpoint → coin store with per-height rewind records.
pub struct CoinStore {
    db: Arc<DB>,
}

impl CoinStore {
    /// Create a store over the shared chain database.
    pub fn new(chain_db: &ChainDb) -> Self {
        Self { db: chain_db.raw() }
    }

    /// Seed the tip marker on first run; returns the effective tip.
    pub fn ensure_initialized(&self, genesis: HashHeightPair) -> Result<HashHeightPair, TarnError> {
        let cf = cf_handle(&self.db, CF_COMMON)?;
        match self
            .db
            .get_cf(&cf, KEY_UTXO_TIP)
            .map_err(|e| TarnError::Storage(e.to_string()))?
        {
            Some(bytes) => {
                let (tip, _): (HashHeightPair, _) =
                    bincode::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| TarnError::Storage(e.to_string()))?;
                Ok(tip)
            }
            None => {
                let bytes = bincode::encode_to_vec(&genesis, bincode::config::standard())
                    .map_err(|e| TarnError::Storage(e.to_string()))?;
                self.db
                    .put_cf(&cf, KEY_UTXO_TIP, &bytes)
                    .map_err(|e| TarnError::Storage(e.to_string()))?;
                debug!(tip = %genesis, "initialized coin store tip");
                Ok(genesis)
            }
        }
    }

    /// Apply a flush batch: coin inserts/deletes, rewind records, and the
    /// new tip, all atomically.
    pub fn persist(&self, changes: FlushChanges<'_>) -> Result<(), TarnError> {
        let cf_coins = cf_handle(&self.db, CF_COINS)?;
        let cf_rewind = cf_handle(&self.db, CF_REWIND)?;
        let cf_common = cf_handle(&self.db, CF_COMMON)?;

        let mut batch = WriteBatch::default();

        for (outpoint, coin) in changes.insert {
            let key = Self::encode_outpoint(outpoint)?;
            let value = bincode::encode_to_vec(coin, bincode::config::standard())
                .map_err(|e| TarnError::Storage(e.to_string()))?;
            batch.put_cf(cf_coins, &key, &value);
        }
        for outpoint in changes.delete {
            let key = Self::encode_outpoint(outpoint)?;
            batch.delete_cf(cf_coins, &key);
        }
        for (height, rewind) in changes.rewind {
            let value = bincode::encode_to_vec(rewind, bincode::config::standard())
                .map_err(|e| TarnError::Storage(e.to_string()))?;
            batch.put_cf(cf_rewind, height_key(*height), &value);
        }
        let tip_bytes = bincode::encode_to_vec(changes.tip, bincode::config::standard())
            .map_err(|e| TarnError::Storage(e.to_string()))?;
        batch.put_cf(cf_common, KEY_UTXO_TIP, &tip_bytes);

        self.db
            .write(batch)
            .map_err(|e| TarnError::Storage(e.to_string()))?;

        debug!(
            inserted = changes.insert.len(),
            deleted = changes.delete.len(),
            rewind_records = changes.rewind.len(),
            tip = %changes.tip,
            "persisted coin changes"
        );
        Ok(())
    }

    /// Delete rewind records at heights at or below `up_to`.
    ///
    /// Called by the prune pass once the records can never be needed again.
    /// Returns the number of records deleted.
    pub fn prune_rewind_records(&self, up_to: u64) -> Result<u64, TarnError> {
        let cf = cf_handle(&self.db, CF_REWIND)?;
        let mut batch = WriteBatch::default();
        let mut deleted = 0u64;

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| TarnError::Storage(e.to_string()))?;
            match decode_height_key(&key) {
                Some(height) if height <= up_to => {
                    batch.delete_cf(cf, &key);
                    deleted += 1;
                }
                _ => break,
            }
        }

        if deleted > 0 {
            self.db
                .write(batch)
                .map_err(|e| TarnError::Storage(e.to_string()))?;
            debug!(deleted, up_to, "pruned rewind records");
        }
        Ok(deleted)
    }

    /// Number of coins currently stored. Test and diagnostics helper;
    /// iterates the whole column family.
    pub fn coin_count(&self) -> Result<u64, TarnError> {
        let cf = cf_handle(&self.db, CF_COINS)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item.map_err(|e| TarnError::Storage(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }

    /// Encode an outpoint as a bincode key.
    fn encode_outpoint(outpoint: &OutPoint) -> Result<Vec<u8>, TarnError> {
        bincode::encode_to_vec(outpoint, bincode::config::standard())
            .map_err(|e| TarnError::Storage(e.to_string()))
    }
}

impl CoinView for CoinStore {
    fn fetch_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, TarnError> {
        let cf = cf_handle(&self.db, CF_COINS)?;
        let key = Self::encode_outpoint(outpoint)?;
        match self
            .db
            .get_cf(&cf, &key)
            .map_err(|e| TarnError::Storage(e.to_string()))?
        {
            Some(bytes) => {
                let (coin, _): (Coin, _) =
                    bincode::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| TarnError::Storage(e.to_string()))?;
                Ok(Some(coin))
            }
            None => Ok(None),
        }
    }

    fn rewind_data(&self, height: u64) -> Result<Option<RewindData>, TarnError> {
        let cf = cf_handle(&self.db, CF_REWIND)?;
        match self
            .db
            .get_cf(&cf, height_key(height))
            .map_err(|e| TarnError::Storage(e.to_string()))?
        {
            Some(bytes) => {
                let (rewind, _): (RewindData, _) =
                    bincode::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| TarnError::Storage(e.to_string()))?;
                Ok(Some(rewind))
            }
            None => Ok(None),
        }
    }

    fn tip(&self) -> Result<HashHeightPair, TarnError> {
        let cf = cf_handle(&self.db, CF_COMMON)?;
        let bytes = self
            .db
            .get_cf(&cf, KEY_UTXO_TIP)
            .map_err(|e| TarnError::Storage(e.to_string()))?
            .ok_or_else(|| TarnError::Storage("coin store tip not initialized".into()))?;
        let (tip, _): (HashHeightPair, _) =
            bincode::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| TarnError::Storage(e.to_string()))?;
        Ok(tip)
    }
}
