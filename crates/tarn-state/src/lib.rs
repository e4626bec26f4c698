//! # tarn-state — The chain-state engine.
//!
//! A reorg-safe, prunable view of chain state for a UTXO node:
//! - [`db::ChainDb`] — shared RocksDB database, one column family per concern
//! - [`header_store::HeaderStore`] — durable header chain, locator-based saves
//! - [`coin_store::CoinStore`] — base coin store with per-height rewind records
//! - [`cache::CoinViewCache`] — write-back overlay batching coin writes
//! - [`rewind_index::RewindDataIndex`] — sliding window over recent spends
//! - [`block_store::BlockStore`] / [`pruning::PruneService`] — body storage and pruning
//! - [`engine::ChainStateEngine`] — initialization/rewind lifecycle

pub mod block_store;
pub mod cache;
pub mod coin_store;
pub mod config;
pub mod db;
pub mod engine;
pub mod header_store;
pub mod pruning;
pub mod rewind_index;

pub use cache::CoinViewCache;
pub use config::StateConfig;
pub use db::ChainDb;
pub use engine::{ChainStateEngine, ConsensusVariant, RuleContext};
pub use pruning::{PruneOutcome, PruneService, PruneState};
