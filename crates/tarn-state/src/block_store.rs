//! Opaque block-body store.
//!
//! The chain-state engine never looks inside a block body (validation is
//! external), so bodies are stored as raw bytes keyed by header hash. The
//! prune pass deletes old bodies in one atomic batch; headers and coins are
//! untouched.

use std::sync::Arc;

use rocksdb::{DB, WriteBatch};

use tarn_core::error::TarnError;
use tarn_core::types::Hash256;

use crate::db::{CF_BLOCKS, ChainDb, cf_handle};

/// Hash-keyed store of serialized block bodies.
pub struct BlockStore {
    db: Arc<DB>,
}

impl BlockStore {
    /// Create a store over the shared chain database.
    pub fn new(chain_db: &ChainDb) -> Self {
        Self { db: chain_db.raw() }
    }

    /// Store a block body.
    pub fn put_body(&self, hash: &Hash256, body: &[u8]) -> Result<(), TarnError> {
        let cf = cf_handle(&self.db, CF_BLOCKS)?;
        self.db
            .put_cf(&cf, hash.as_bytes(), body)
            .map_err(|e| TarnError::Storage(e.to_string()))
    }

    /// Fetch a block body. Returns `None` if unknown or pruned.
    pub fn get_body(&self, hash: &Hash256) -> Result<Option<Vec<u8>>, TarnError> {
        let cf = cf_handle(&self.db, CF_BLOCKS)?;
        self.db
            .get_cf(&cf, hash.as_bytes())
            .map_err(|e| TarnError::Storage(e.to_string()))
    }

    /// Whether a body is present.
    pub fn has_body(&self, hash: &Hash256) -> Result<bool, TarnError> {
        Ok(self.get_body(hash)?.is_some())
    }

    /// Delete a set of bodies in one atomic batch.
    ///
    /// Missing hashes are ignored; deletion is idempotent.
    pub fn delete_bodies(&self, hashes: &[Hash256]) -> Result<(), TarnError> {
        if hashes.is_empty() {
            return Ok(());
        }
        let cf = cf_handle(&self.db, CF_BLOCKS)?;
        let mut batch = WriteBatch::default();
        for hash in hashes {
            batch.delete_cf(cf, hash.as_bytes());
        }
        self.db
            .write(batch)
            .map_err(|e| TarnError::Storage(e.to_string()))
    }
}
