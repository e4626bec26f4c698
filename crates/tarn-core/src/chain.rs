//! In-memory header chain: an arena of linked headers with skip pointers.
//!
//! Headers form a tree rooted at genesis; only one branch is active at a
//! time, selected by greatest cumulative work. Nodes are indexed by a stable
//! [`HeaderId`] and store their parent's id, which keeps ownership acyclic
//! and makes ancestor stepping O(log n) via skip pointers.
//!
//! The tree is rebuilt at startup by [`HeaderTree::from_records`] from the
//! height-keyed records the header store persists, and extended at runtime
//! with [`HeaderTree::insert`] as the network layer accepts new headers.

use std::collections::HashMap;

use crate::constants::MAX_LOCATOR_SIZE;
use crate::error::HeaderTreeError;
use crate::types::{BlockHeader, Hash256, HashHeightPair};

/// Stable identifier of a header inside the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeaderId(u32);

/// A header linked into the tree.
///
/// Immutable once linked; destroyed only when the tree itself is dropped
/// (headers are cheap and kept for the node's lifetime).
#[derive(Clone, Debug)]
pub struct ChainedHeader {
    /// Hash of this header.
    pub hash: Hash256,
    /// Hash of the parent header. Zero for genesis.
    pub prev_hash: Hash256,
    /// Height of this header; genesis is 0.
    pub height: u64,
    /// Work contributed by this header alone.
    pub work: u128,
    /// Cumulative work from genesis through this header.
    pub chain_work: u128,
    /// Parent node id. `None` only for genesis.
    parent: Option<HeaderId>,
    /// Skip pointer to a distant ancestor, for O(log n) stepping.
    skip: Option<HeaderId>,
}

impl ChainedHeader {
    /// Tip marker for this header.
    pub fn pair(&self) -> HashHeightPair {
        HashHeightPair::new(self.hash, self.height)
    }
}

/// Height the skip pointer of a node at `height` points to.
///
/// Turns the lowest set bit off, which yields exponentially spaced jumps
/// while keeping every walk bounded by O(log n) steps.
fn skip_height(height: u64) -> u64 {
    if height < 2 {
        return 0;
    }
    let invert_lowest_one = |n: u64| n & n.wrapping_sub(1);
    if height & 1 == 1 {
        invert_lowest_one(height - 1) + 1
    } else {
        invert_lowest_one(height)
    }
}

/// Arena-backed tree of block headers.
pub struct HeaderTree {
    nodes: Vec<ChainedHeader>,
    by_hash: HashMap<Hash256, HeaderId>,
    best: HeaderId,
}

impl HeaderTree {
    /// Create a tree containing only the genesis header.
    pub fn new(genesis: &BlockHeader) -> Self {
        let hash = genesis.hash();
        let work = genesis.work();
        let root = ChainedHeader {
            hash,
            prev_hash: genesis.prev_hash,
            height: 0,
            work,
            chain_work: work,
            parent: None,
            skip: None,
        };
        let mut by_hash = HashMap::new();
        by_hash.insert(hash, HeaderId(0));
        Self {
            nodes: vec![root],
            by_hash,
            best: HeaderId(0),
        }
    }

    /// Rebuild a linear chain from persisted `(hash, cumulative_work)`
    /// records ordered by height starting at genesis.
    ///
    /// Each record is linked to its predecessor; per-header work is derived
    /// from the difference of cumulative work.
    pub fn from_records(records: &[(Hash256, u128)]) -> Self {
        assert!(!records.is_empty(), "records must include genesis");

        let (genesis_hash, genesis_work) = records[0];
        let root = ChainedHeader {
            hash: genesis_hash,
            prev_hash: Hash256::ZERO,
            height: 0,
            work: genesis_work,
            chain_work: genesis_work,
            parent: None,
            skip: None,
        };
        let mut tree = Self {
            nodes: vec![root],
            by_hash: HashMap::from([(genesis_hash, HeaderId(0))]),
            best: HeaderId(0),
        };

        let mut prev = HeaderId(0);
        for (hash, chain_work) in &records[1..] {
            let parent_work = tree.nodes[prev.0 as usize].chain_work;
            let work = chain_work.saturating_sub(parent_work).max(1);
            prev = tree.link(*hash, prev, work);
        }
        tree
    }

    /// Insert a new header whose parent is already in the tree.
    ///
    /// # Errors
    ///
    /// - [`HeaderTreeError::DuplicateHeader`] if the hash is already present
    /// - [`HeaderTreeError::UnknownParent`] if `prev_hash` is not in the tree
    pub fn insert(&mut self, header: &BlockHeader) -> Result<HeaderId, HeaderTreeError> {
        let hash = header.hash();
        if self.by_hash.contains_key(&hash) {
            return Err(HeaderTreeError::DuplicateHeader(hash.to_string()));
        }
        let parent = *self
            .by_hash
            .get(&header.prev_hash)
            .ok_or_else(|| HeaderTreeError::UnknownParent(header.prev_hash.to_string()))?;
        Ok(self.link(hash, parent, header.work()))
    }

    /// Link a node under `parent` and update the best tip if it now carries
    /// the most cumulative work. Ties keep the first-seen tip.
    fn link(&mut self, hash: Hash256, parent: HeaderId, work: u128) -> HeaderId {
        let height = self.nodes[parent.0 as usize].height + 1;
        let chain_work = self.nodes[parent.0 as usize].chain_work + work;
        let skip = self.ancestor(parent, skip_height(height));

        let id = HeaderId(self.nodes.len() as u32);
        self.nodes.push(ChainedHeader {
            hash,
            prev_hash: self.nodes[parent.0 as usize].hash,
            height,
            work,
            chain_work,
            parent: Some(parent),
            skip,
        });
        self.by_hash.insert(hash, id);

        if chain_work > self.nodes[self.best.0 as usize].chain_work {
            self.best = id;
        }
        id
    }

    /// Number of headers in the tree (all branches).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds only genesis.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// The header node for an id.
    pub fn header(&self, id: HeaderId) -> &ChainedHeader {
        &self.nodes[id.0 as usize]
    }

    /// Look up a header id by hash.
    pub fn get(&self, hash: &Hash256) -> Option<HeaderId> {
        self.by_hash.get(hash).copied()
    }

    /// Id of the best (most-work) tip.
    pub fn best_id(&self) -> HeaderId {
        self.best
    }

    /// The best tip node.
    pub fn best(&self) -> &ChainedHeader {
        self.header(self.best)
    }

    /// Tip marker of the best tip.
    pub fn tip_pair(&self) -> HashHeightPair {
        self.best().pair()
    }

    /// Ancestor of `id` at `height`, following skip pointers where possible.
    ///
    /// Returns `Some(id)` itself when `height` equals the node's height and
    /// `None` when `height` is above it.
    pub fn ancestor(&self, id: HeaderId, height: u64) -> Option<HeaderId> {
        let mut current = id;
        if height > self.header(current).height {
            return None;
        }
        while self.header(current).height > height {
            let node = self.header(current);
            current = match node.skip {
                Some(skip) if self.header(skip).height >= height => skip,
                _ => node.parent?,
            };
        }
        Some(current)
    }

    /// Find `hash` if it is `tip` itself or one of its ancestors.
    ///
    /// Returns `None` when the hash is unknown or lies on another branch.
    pub fn find_ancestor_or_self(&self, tip: HeaderId, hash: &Hash256) -> Option<HeaderId> {
        let id = self.get(hash)?;
        let height = self.header(id).height;
        (self.ancestor(tip, height) == Some(id)).then_some(id)
    }

    /// Hash on the active (best) chain at `height`, if within the tip.
    pub fn active_hash_at(&self, height: u64) -> Option<Hash256> {
        self.ancestor(self.best, height)
            .map(|id| self.header(id).hash)
    }

    /// Block locator for the chain ending at `from`.
    ///
    /// Hashes are geometrically spaced: the first ~10 step back one height
    /// at a time, then the step doubles. Always ends at genesis and never
    /// exceeds [`MAX_LOCATOR_SIZE`] entries.
    pub fn locator(&self, from: HeaderId) -> Vec<HashHeightPair> {
        let mut locator = Vec::new();
        let mut step = 1u64;
        let mut height = self.header(from).height;

        loop {
            if let Some(id) = self.ancestor(from, height) {
                locator.push(self.header(id).pair());
            }
            if height == 0 {
                break;
            }
            // Force the final entry to be genesis once the cap is near.
            if locator.len() >= MAX_LOCATOR_SIZE - 1 {
                height = 0;
                continue;
            }
            height = height.saturating_sub(step);
            if locator.len() > 10 {
                step *= 2;
            }
        }
        locator
    }
}
