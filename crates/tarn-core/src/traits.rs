//! Trait interfaces for the chain-state engine.
//!
//! [`CoinView`] is the read-only contract between the coin stores and their
//! consumers (rule engine, mempool, wallet queries). The base store and the
//! write-back cache both implement it; the cache layers its dirty set on top
//! of whatever the base answers.

use crate::error::TarnError;
use crate::types::{Coin, HashHeightPair, OutPoint, RewindData};

/// Read-only view of the coin set and its rewind records.
pub trait CoinView: Send + Sync {
    /// Look up a coin by outpoint. Returns `None` if spent or unknown.
    fn fetch_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, TarnError>;

    /// Check whether an outpoint is unspent.
    ///
    /// Default implementation delegates to [`fetch_coin`](Self::fetch_coin).
    fn contains_coin(&self, outpoint: &OutPoint) -> Result<bool, TarnError> {
        Ok(self.fetch_coin(outpoint)?.is_some())
    }

    /// The rewind record for a height. Returns `None` if absent or pruned.
    fn rewind_data(&self, height: u64) -> Result<Option<RewindData>, TarnError>;

    /// Current tip marker of this view.
    fn tip(&self) -> Result<HashHeightPair, TarnError>;
}
