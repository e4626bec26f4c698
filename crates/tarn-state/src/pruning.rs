//! Pruning coordinator: bounds disk usage by deleting old block bodies.
//!
//! Two cooperating pieces with one invariant: the persisted pruned tip
//! never rises above `utxo_tip - blocks_to_keep`. The [`PrunedTipStore`]
//! persists the marker; the [`PruneService`] runs on a timer (and once at
//! startup), walks the header chain for the bodies that fell out of the
//! keep window, deletes them in one batch, and only then advances the
//! marker — so a crash mid-prune leaves the old marker intact and the next
//! pass retries from the same point.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rocksdb::DB;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use tarn_core::chain::HeaderTree;
use tarn_core::error::TarnError;
use tarn_core::genesis;
use tarn_core::types::{Hash256, HashHeightPair};

use crate::block_store::BlockStore;
use crate::cache::CoinViewCache;
use crate::coin_store::CoinStore;
use crate::config::StateConfig;
use crate::db::{CF_COMMON, ChainDb, KEY_PRUNED_TIP, cf_handle};

/// Persisted marker: the lowest height whose body is guaranteed present.
pub struct PrunedTipStore {
    db: Arc<DB>,
}

impl PrunedTipStore {
    /// Create a store over the shared chain database.
    pub fn new(chain_db: &ChainDb) -> Self {
        Self { db: chain_db.raw() }
    }

    /// Read the pruned tip, if one was ever persisted.
    pub fn get(&self) -> Result<Option<HashHeightPair>, TarnError> {
        let cf = cf_handle(&self.db, CF_COMMON)?;
        match self
            .db
            .get_cf(&cf, KEY_PRUNED_TIP)
            .map_err(|e| TarnError::Storage(e.to_string()))?
        {
            Some(bytes) => {
                let (pair, _): (HashHeightPair, _) =
                    bincode::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| TarnError::Storage(e.to_string()))?;
                Ok(Some(pair))
            }
            None => Ok(None),
        }
    }

    /// Persist a new pruned tip.
    pub fn set(&self, pair: &HashHeightPair) -> Result<(), TarnError> {
        let cf = cf_handle(&self.db, CF_COMMON)?;
        let bytes = bincode::encode_to_vec(pair, bincode::config::standard())
            .map_err(|e| TarnError::Storage(e.to_string()))?;
        self.db
            .put_cf(&cf, KEY_PRUNED_TIP, &bytes)
            .map_err(|e| TarnError::Storage(e.to_string()))
    }

    /// Seed the marker at genesis on first run; returns the effective tip.
    pub fn ensure_initialized(&self) -> Result<HashHeightPair, TarnError> {
        match self.get()? {
            Some(pair) => Ok(pair),
            None => {
                let pair = genesis::genesis_pair();
                self.set(&pair)?;
                debug!("initialized pruned tip at genesis");
                Ok(pair)
            }
        }
    }
}

/// Lifecycle of the prune loop. No terminal state while the node runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PruneState {
    /// No pass has run yet.
    Uninitialized,
    /// Waiting for the next tick.
    Idle,
    /// A pass is in flight.
    Pruning,
}

/// Result of one prune pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PruneOutcome {
    /// Thresholds not met; nothing deleted, marker unchanged.
    Skipped,
    /// Bodies deleted and the marker advanced.
    Pruned {
        /// Number of bodies deleted.
        deleted: u64,
        /// The new pruned tip.
        new_tip: HashHeightPair,
    },
}

/// Background coordinator deleting block bodies past the keep window.
pub struct PruneService {
    tree: Arc<RwLock<HeaderTree>>,
    cache: Arc<RwLock<CoinViewCache>>,
    blocks: BlockStore,
    coins: CoinStore,
    pruned_tip: PrunedTipStore,
    blocks_to_keep: u64,
    max_reorg_length: u64,
    interval: Duration,
    state: Mutex<PruneState>,
}

impl PruneService {
    /// Create a prune service over the shared state.
    pub fn new(
        tree: Arc<RwLock<HeaderTree>>,
        cache: Arc<RwLock<CoinViewCache>>,
        chain_db: &ChainDb,
        config: &StateConfig,
    ) -> Self {
        Self {
            tree,
            cache,
            blocks: BlockStore::new(chain_db),
            coins: CoinStore::new(chain_db),
            pruned_tip: PrunedTipStore::new(chain_db),
            blocks_to_keep: config.blocks_to_keep,
            max_reorg_length: config.max_reorg_length,
            interval: config.prune_interval(),
            state: Mutex::new(PruneState::Uninitialized),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PruneState {
        *self.state.lock()
    }

    /// Current prune floor, for "data no longer available" checks on block
    /// read paths.
    pub fn pruned_up_to(&self) -> Result<Option<HashHeightPair>, TarnError> {
        self.pruned_tip.get()
    }

    /// Whether the body at `height` may have been deleted, so read paths can
    /// report "data no longer available" without attempting a body fetch.
    /// Genesis is never pruned.
    pub fn is_pruned(&self, height: u64) -> Result<bool, TarnError> {
        let floor = self.pruned_tip.get()?.map(|pair| pair.height).unwrap_or(0);
        Ok(height > 0 && height <= floor)
    }

    /// Run one prune pass.
    pub fn prune_once(&self) -> Result<PruneOutcome, TarnError> {
        *self.state.lock() = PruneState::Pruning;
        let outcome = self.prune_pass();
        *self.state.lock() = PruneState::Idle;
        outcome
    }

    fn prune_pass(&self) -> Result<PruneOutcome, TarnError> {
        let pruned = self.pruned_tip.ensure_initialized()?;
        let utxo_tip = self.cache.read().tip();

        if utxo_tip.height < self.blocks_to_keep {
            return Ok(PruneOutcome::Skipped);
        }
        if utxo_tip.height == pruned.height {
            return Ok(PruneOutcome::Skipped);
        }
        if utxo_tip.height <= pruned.height + self.blocks_to_keep {
            return Ok(PruneOutcome::Skipped);
        }

        let prune_from = utxo_tip.height - self.blocks_to_keep;

        // Resolve the ancestor walk under the tree lock; delete afterwards.
        let (hashes, new_tip) = {
            let tree = self.tree.read();
            let Some(start) = tree.ancestor(tree.best_id(), prune_from) else {
                warn!(
                    height = prune_from,
                    "header chain cannot resolve prune start; skipping pass"
                );
                return Ok(PruneOutcome::Skipped);
            };
            let new_tip = tree.header(start).pair();

            let mut hashes: Vec<Hash256> = Vec::new();
            let mut current = start;
            loop {
                let node = tree.header(current);
                // Down to, but not including, the current pruned tip.
                if node.height <= pruned.height {
                    break;
                }
                hashes.push(node.hash);
                match tree.ancestor(current, node.height - 1) {
                    Some(parent) => current = parent,
                    None => {
                        warn!(height = node.height, "broken header chain link during prune walk");
                        break;
                    }
                }
            }
            (hashes, new_tip)
        };

        // One atomic batch; the marker only advances after it succeeds.
        self.blocks.delete_bodies(&hashes)?;

        // Rewind records below both the keep window and the reorg window can
        // never be needed again.
        let rewind_floor = prune_from.min(utxo_tip.height.saturating_sub(self.max_reorg_length));
        self.coins.prune_rewind_records(rewind_floor)?;

        self.pruned_tip.set(&new_tip)?;
        info!(deleted = hashes.len(), new_tip = %new_tip, "pruned block bodies");
        Ok(PruneOutcome::Pruned {
            deleted: hashes.len() as u64,
            new_tip,
        })
    }

    /// Run the prune loop: one pass at startup, then one per interval,
    /// until the shutdown signal flips. The in-flight pass always finishes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.prune_once() {
            warn!("startup prune pass failed: {e}; retrying next pass");
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.prune_once() {
                        warn!("prune pass failed: {e}; retrying next pass");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("prune loop stopping");
                        break;
                    }
                }
            }
        }
    }
}
