//! Core chain-state types: hashes, outpoints, coins, headers, rewind data.
//!
//! All monetary values are in tarns (1 TARN = 10^8 tarns). All numeric
//! fields use u64 per protocol convention; cumulative work uses u128.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte hash value.
///
/// Used for block header hashes (double SHA-256) and transaction IDs
/// (produced by the external validation layer).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Marks "no previous block" at genesis.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u64,
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// An unspent transaction output tracked by the coin store.
///
/// Exists from the block that created it until the block that spends it.
/// Never edited in place: insert on creation, delete on spend.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Coin {
    /// Value in tarns.
    pub value: u64,
    /// Locking script; opaque to the chain-state engine.
    pub script_pubkey: Vec<u8>,
    /// Whether the creating transaction was a coinbase.
    pub is_coinbase: bool,
    /// Height of the block that created this output.
    pub height: u64,
}

/// Result of looking up a single outpoint through the coin cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoinStatus {
    /// The output exists and is unspent.
    Unspent(Coin),
    /// The output is known to have been spent (pending flush to disk).
    Spent,
    /// The output is not present in the cache or the base store.
    Unknown,
}

impl CoinStatus {
    /// The coin, if unspent.
    pub fn coin(&self) -> Option<&Coin> {
        match self {
            Self::Unspent(coin) => Some(coin),
            _ => None,
        }
    }
}

/// A (block-hash, height) pair used as a tip marker.
///
/// Totally orders tips only when both belong to the same chain; comparing
/// across branches requires walking ancestors in the header tree.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct HashHeightPair {
    /// Block header hash.
    pub hash: Hash256,
    /// Block height.
    pub height: u64,
}

impl HashHeightPair {
    /// Create a new pair.
    pub fn new(hash: Hash256, height: u64) -> Self {
        Self { hash, height }
    }
}

impl fmt::Display for HashHeightPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash, self.height)
    }
}

/// Block header carried by the header chain.
///
/// The chain-state engine reads only `prev_hash` and the work derived from
/// `difficulty_target`; the remaining fields exist so the hash commits to
/// the same content as on the wire.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u64,
    /// Hash of the previous block header.
    pub prev_hash: Hash256,
    /// Merkle root of the block's transactions.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Compact difficulty target. Smaller targets mean more work.
    pub difficulty_target: u64,
    /// Proof nonce.
    pub nonce: u64,
}

impl BlockHeader {
    /// Header size in bytes when serialized for hashing (4 u64 fields + 2 * 32-byte hashes).
    const HASH_SIZE: usize = 4 * 8 + 2 * 32;

    /// Compute the block header hash (double SHA-256).
    ///
    /// Uses an explicit fixed byte layout: version || prev_hash || merkle_root ||
    /// timestamp || difficulty_target || nonce, all little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.difficulty_target.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        let first = Sha256::digest(&data);
        let second = Sha256::digest(first);
        Hash256(second.into())
    }

    /// Expected work for this header, derived from the difficulty target.
    ///
    /// Approximates 2^64 / (target + 1); never less than 1 so cumulative
    /// work is strictly increasing along any chain.
    pub fn work(&self) -> u128 {
        ((1u128 << 64) / (self.difficulty_target as u128 + 1)).max(1)
    }
}

/// Undo data for one block height.
///
/// Created synchronously with the block's coin-set update; re-applied in
/// reverse by `Rewind`. Retained at least `max_reorg_length` blocks and
/// deleted only once pruning passes the height.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct RewindData {
    /// Hash of the block below this one; becomes the tip after an undo.
    pub previous_tip: Hash256,
    /// Coins spent by this block, re-inserted on undo.
    pub spent_coins: Vec<(OutPoint, Coin)>,
    /// Outpoints created by this block, deleted on undo.
    pub created_outpoints: Vec<OutPoint>,
}

impl RewindData {
    /// Create a rewind record for a block.
    pub fn new(
        previous_tip: Hash256,
        spent_coins: Vec<(OutPoint, Coin)>,
        created_outpoints: Vec<OutPoint>,
    ) -> Self {
        Self {
            previous_tip,
            spent_coins,
            created_outpoints,
        }
    }

    /// Outpoints of the coins this block spent.
    pub fn spent_outpoints(&self) -> Vec<OutPoint> {
        self.spent_coins.iter().map(|(op, _)| op.clone()).collect()
    }
}
