//! RocksDB database shared by the chain-state stores.
//!
//! One database, one column family per concern. The component stores
//! ([`HeaderStore`](crate::header_store::HeaderStore),
//! [`CoinStore`](crate::coin_store::CoinStore),
//! [`BlockStore`](crate::block_store::BlockStore)) share the handle via
//! `Arc` and only ever touch their own column families. All mutations go
//! through atomic [`rocksdb::WriteBatch`]es.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, DB, Options};

use tarn_core::error::TarnError;

/// Height-keyed `(hash, cumulative work)` header records.
pub const CF_HEADERS: &str = "headers";
/// Outpoint-keyed unspent coins.
pub const CF_COINS: &str = "coins";
/// Height-keyed rewind records.
pub const CF_REWIND: &str = "rewind";
/// Hash-keyed opaque block bodies.
pub const CF_BLOCKS: &str = "blocks";
/// Singleton markers: UTXO tip, pruned tip, last-saved locator.
pub const CF_COMMON: &str = "common";

/// All column family names.
const ALL_CFS: &[&str] = &[CF_HEADERS, CF_COINS, CF_REWIND, CF_BLOCKS, CF_COMMON];

// --- Common-CF keys ---

/// UTXO tip marker (bincode `HashHeightPair`).
pub(crate) const KEY_UTXO_TIP: &[u8] = b"utxo_tip";
/// Pruned tip marker (bincode `HashHeightPair`).
pub(crate) const KEY_PRUNED_TIP: &[u8] = b"pruned_tip";
/// Locator of the last-saved header chain (bincode `Vec<HashHeightPair>`).
pub(crate) const KEY_HEADER_LOCATOR: &[u8] = b"header_locator";

/// Handle to the shared chain database.
#[derive(Clone)]
pub struct ChainDb {
    db: Arc<DB>,
}

impl ChainDb {
    /// Open or create the database at the given path with all column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TarnError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| TarnError::Storage(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// The raw database handle.
    pub(crate) fn raw(&self) -> Arc<DB> {
        Arc::clone(&self.db)
    }
}

/// Get a column family handle by name.
pub(crate) fn cf_handle<'a>(db: &'a DB, name: &str) -> Result<&'a rocksdb::ColumnFamily, TarnError> {
    db.cf_handle(name)
        .ok_or_else(|| TarnError::Storage(format!("missing column family: {name}")))
}

/// Encode a height as big-endian bytes for ordered iteration.
pub(crate) fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

/// Decode a big-endian height key.
pub(crate) fn decode_height_key(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
