//! Chain-state orchestrator: rule-engine lifecycle over the stores.
//!
//! The engine owns the shared header tree and coin cache, aligns the UTXO
//! tip with the header chain at startup, hands out per-block rule contexts,
//! and flushes everything on shutdown. Consensus-variant differences (PoW
//! vs PoS) are a tagged [`RuleContext`] selected at construction; the
//! lifecycle code lives here once and only calls the small per-variant
//! capability surface.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use tarn_core::chain::HeaderTree;
use tarn_core::error::{ConsistencyError, TarnError};
use tarn_core::genesis;
use tarn_core::types::{Coin, Hash256, HashHeightPair, OutPoint, RewindData};

use crate::cache::CoinViewCache;
use crate::coin_store::CoinStore;
use crate::config::StateConfig;
use crate::db::ChainDb;
use crate::header_store::HeaderStore;

/// Consensus flavour the node runs, fixed at construction time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsensusVariant {
    /// Nakamoto proof-of-work.
    ProofOfWork,
    /// Proof-of-stake with a minimum stake depth for kernel inputs.
    ProofOfStake {
        /// Confirmations a staked coin needs before it may sign a block.
        min_stake_depth: u64,
    },
}

/// Per-block validation context for the proof-of-work rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PowRuleContext {
    /// The block being connected.
    pub block: HashHeightPair,
    /// The tip it builds on.
    pub parent: HashHeightPair,
}

/// Per-block validation context for the proof-of-stake rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PosRuleContext {
    /// The block being connected.
    pub block: HashHeightPair,
    /// The tip it builds on.
    pub parent: HashHeightPair,
    /// Minimum confirmations required of the staking input.
    pub min_stake_depth: u64,
}

/// Tagged rule context; one variant per consensus flavour.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleContext {
    /// Proof-of-work payload.
    Pow(PowRuleContext),
    /// Proof-of-stake payload.
    Pos(PosRuleContext),
}

impl RuleContext {
    /// Hash of the block this context validates.
    pub fn block_hash(&self) -> Hash256 {
        match self {
            Self::Pow(ctx) => ctx.block.hash,
            Self::Pos(ctx) => ctx.block.hash,
        }
    }

    /// Height of the block this context validates.
    pub fn height(&self) -> u64 {
        match self {
            Self::Pow(ctx) => ctx.block.height,
            Self::Pos(ctx) => ctx.block.height,
        }
    }

    /// The tip the block builds on.
    pub fn parent(&self) -> &HashHeightPair {
        match self {
            Self::Pow(ctx) => &ctx.parent,
            Self::Pos(ctx) => &ctx.parent,
        }
    }
}

/// Orchestrator of the chain-state lifecycle.
pub struct ChainStateEngine {
    variant: ConsensusVariant,
    chain_db: ChainDb,
    header_store: HeaderStore,
    tree: Arc<RwLock<HeaderTree>>,
    cache: Arc<RwLock<CoinViewCache>>,
    max_reorg_length: u64,
}

impl ChainStateEngine {
    /// Open all stores under `config.db_path()` and assemble an engine.
    ///
    /// Loads (or seeds) the header chain and the coin-store tip marker.
    pub fn open(variant: ConsensusVariant, config: &StateConfig) -> Result<Self, TarnError> {
        let chain_db = ChainDb::open(config.db_path())?;

        let header_store = HeaderStore::new(&chain_db);
        let tree = header_store.load(genesis::genesis_header())?;

        let coin_store = CoinStore::new(&chain_db);
        coin_store.ensure_initialized(genesis::genesis_pair())?;
        let cache = CoinViewCache::new(coin_store, config.max_reorg_length)?;

        Ok(Self {
            variant,
            chain_db,
            header_store,
            tree: Arc::new(RwLock::new(tree)),
            cache: Arc::new(RwLock::new(cache)),
            max_reorg_length: config.max_reorg_length,
        })
    }

    /// The shared database handle (for wiring up the prune service).
    pub fn chain_db(&self) -> &ChainDb {
        &self.chain_db
    }

    /// The shared header tree.
    pub fn tree(&self) -> Arc<RwLock<HeaderTree>> {
        Arc::clone(&self.tree)
    }

    /// The shared coin cache.
    pub fn cache(&self) -> Arc<RwLock<CoinViewCache>> {
        Arc::clone(&self.cache)
    }

    /// Align the UTXO tip with the header chain ending at `chain_tip`.
    ///
    /// Initializes the rewind index, verifies its floor against the
    /// finalized height, then rewinds until the UTXO tip is an ancestor of
    /// (or equal to) `chain_tip`. Each rewind strictly decreases the tip,
    /// so the loop terminates at the fork point — genesis in the worst
    /// case — with no overshoot.
    ///
    /// # Errors
    ///
    /// - [`ConsistencyError::BrokenHeaderChain`] if `chain_tip` is not in
    ///   the header tree
    /// - [`ConsistencyError::FinalityViolation`] if the rewind index floor
    ///   sits above the finalized height (corrupt or incompatible on-disk
    ///   state)
    /// - Any rewind failure, which at startup is fatal
    pub fn initialize(&self, chain_tip: &HashHeightPair) -> Result<HashHeightPair, TarnError> {
        {
            let mut cache = self.cache.write();
            cache.initialize_index()?;

            let tip_height = cache.tip().height;
            if tip_height > 0 {
                let finalized = tip_height.saturating_sub(self.max_reorg_length);
                let floor = cache
                    .rewind_index()
                    .lowest_height()
                    .unwrap_or(tip_height + 1);
                if floor > finalized + 1 {
                    return Err(ConsistencyError::FinalityViolation { floor, finalized }.into());
                }
            }
        }

        let target = {
            let tree = self.tree.read();
            tree.get(&chain_tip.hash)
                .ok_or(ConsistencyError::BrokenHeaderChain {
                    height: chain_tip.height,
                })?
        };

        let mut rewinds = 0u64;
        let tip = loop {
            let tip = self.cache.read().tip();
            let aligned = {
                let tree = self.tree.read();
                tree.find_ancestor_or_self(target, &tip.hash).is_some()
            };
            if aligned {
                break tip;
            }
            let new_tip = self.cache.write().rewind()?;
            rewinds += 1;
            debug!(to = %new_tip, "utxo tip not on target chain; rewound");
        };

        info!(rewinds, tip = %tip, "chain state aligned with header chain");
        Ok(tip)
    }

    /// Build the per-variant rule context for a block extending the tip.
    pub fn create_rule_context(&self, block: HashHeightPair) -> RuleContext {
        let parent = self.cache.read().tip();
        match self.variant {
            ConsensusVariant::ProofOfWork => RuleContext::Pow(PowRuleContext { block, parent }),
            ConsensusVariant::ProofOfStake { min_stake_depth } => {
                RuleContext::Pos(PosRuleContext {
                    block,
                    parent,
                    min_stake_depth,
                })
            }
        }
    }

    /// Stage a validated block's coin delta under the writer lock.
    ///
    /// The validation layer supplies the authoritative spent/created sets;
    /// the engine never decides validity.
    pub fn connect_block(
        &self,
        ctx: &RuleContext,
        spent: &[OutPoint],
        created: &[(OutPoint, Coin)],
        rewind: RewindData,
    ) -> Result<(), TarnError> {
        let new_tip = HashHeightPair::new(ctx.block_hash(), ctx.height());
        self.cache.write().save_changes(new_tip, spent, created, rewind)
    }

    /// Undo the tip block; the caller re-validates forward from the
    /// returned tip.
    pub fn rewind(&self) -> Result<HashHeightPair, TarnError> {
        self.cache.write().rewind()
    }

    /// Force staged coin state to disk.
    pub fn flush(&self) -> Result<(), TarnError> {
        self.cache.write().flush()
    }

    /// Flush everything for shutdown: header chain first, then the coin
    /// cache. Runs on every exit path; a missed flush self-heals on the
    /// next start via [`initialize`](Self::initialize).
    pub fn shutdown(&self) -> Result<(), TarnError> {
        self.header_store.save(&self.tree.read())?;
        self.cache.write().flush()?;
        info!("chain state engine shut down");
        Ok(())
    }
}
