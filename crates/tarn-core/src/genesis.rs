//! Genesis header definition for the Tarn network.
//!
//! The chain-state engine only needs the header at height 0: every store
//! anchors its tip markers and its header chain to this record. All values
//! are hardcoded and deterministic — every node computes the identical
//! genesis header.

use std::sync::LazyLock;

use crate::types::{BlockHeader, Hash256, HashHeightPair};

/// Genesis timestamp: January 1, 2026 00:00:00 UTC.
pub const GENESIS_TIMESTAMP: u64 = 1_767_225_600;

/// Cached genesis data, computed once on first access.
struct GenesisData {
    header: BlockHeader,
    hash: Hash256,
}

static GENESIS: LazyLock<GenesisData> = LazyLock::new(build_genesis);

fn build_genesis() -> GenesisData {
    let header = BlockHeader {
        version: 1,
        prev_hash: Hash256::ZERO,
        merkle_root: Hash256::ZERO,
        timestamp: GENESIS_TIMESTAMP,
        difficulty_target: u64::MAX,
        nonce: 0,
    };
    let hash = header.hash();
    GenesisData { header, hash }
}

/// The genesis block header.
pub fn genesis_header() -> &'static BlockHeader {
    &GENESIS.header
}

/// Hash of the genesis header.
pub fn genesis_hash() -> Hash256 {
    GENESIS.hash
}

/// The genesis tip marker: (genesis hash, height 0).
pub fn genesis_pair() -> HashHeightPair {
    HashHeightPair::new(GENESIS.hash, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_hash_matches_header() {
        assert_eq!(genesis_hash(), genesis_header().hash());
    }

    #[test]
    fn genesis_has_no_parent() {
        assert!(genesis_header().prev_hash.is_zero());
    }

    #[test]
    fn genesis_pair_is_height_zero() {
        let pair = genesis_pair();
        assert_eq!(pair.height, 0);
        assert_eq!(pair.hash, genesis_hash());
    }
}
