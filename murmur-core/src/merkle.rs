use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::StateEntry;

/// Depth of the comparison tree below the root.
pub const TREE_DEPTH: usize = 4;
/// Number of leaf buckets state entries are hashed into.
pub const LEAF_COUNT: usize = 1 << TREE_DEPTH;
const NODE_COUNT: usize = (1 << (TREE_DEPTH + 1)) - 1;
const FIRST_LEAF: usize = NODE_COUNT - LEAF_COUNT;

/// A single SHA-256 hash value.
pub type DigestHash = [u8; 32];

/// Fixed-depth binary hash tree over a replica's state entries.
///
/// Stored as a flat array with the root at index 0 and the children of node
/// `i` at `2i + 1` and `2i + 2`. Two replicas holding the same entries
/// produce identical trees as long as entries are fed in ascending key
/// order, which [`crate::store::ReplicatedStore::digest`] guarantees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleSummary {
    nodes: Vec<DigestHash>,
}

impl MerkleSummary {
    /// Build a summary from entries supplied in ascending key order.
    #[must_use]
    pub fn build<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a StateEntry>,
    {
        let mut leaves: Vec<Sha256> = (0..LEAF_COUNT).map(|_| Sha256::new()).collect();
        for entry in entries {
            let bucket = bucket_for_key(&entry.key) as usize;
            leaves[bucket].update(entry_hash(entry));
        }

        let mut nodes = vec![[0u8; 32]; NODE_COUNT];
        for (offset, hasher) in leaves.into_iter().enumerate() {
            nodes[FIRST_LEAF + offset] = hasher.finalize().into();
        }
        for index in (0..FIRST_LEAF).rev() {
            let mut hasher = Sha256::new();
            hasher.update(nodes[2 * index + 1]);
            hasher.update(nodes[2 * index + 2]);
            nodes[index] = hasher.finalize().into();
        }
        Self { nodes }
    }

    /// Root hash, the replica's state digest.
    #[must_use]
    pub fn root(&self) -> DigestHash {
        self.nodes.first().copied().unwrap_or_default()
    }

    /// Leaf bucket indices whose hashes differ between the two trees.
    ///
    /// Walks the trees top-down and only descends where hashes diverge, so
    /// matching subtrees are skipped without touching their leaves.
    #[must_use]
    pub fn diverging_leaves(&self, other: &Self) -> Vec<u32> {
        if self.nodes.len() != other.nodes.len() {
            return (0..LEAF_COUNT as u32).collect();
        }

        let mut diverging = Vec::new();
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            if self.nodes[index] == other.nodes[index] {
                continue;
            }
            if index >= FIRST_LEAF {
                diverging.push((index - FIRST_LEAF) as u32);
            } else {
                stack.push(2 * index + 2);
                stack.push(2 * index + 1);
            }
        }
        diverging.sort_unstable();
        diverging
    }
}

/// Leaf bucket a key hashes into.
#[must_use]
pub fn bucket_for_key(key: &str) -> u32 {
    let digest: DigestHash = Sha256::digest(key.as_bytes()).into();
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % LEAF_COUNT as u32
}

/// Content hash of one state entry.
///
/// Covers key, canonical JSON value, and version so that replicas holding
/// identical key/value/version content hash identically regardless of how
/// the entry arrived or what conflict metadata it carries.
fn entry_hash(entry: &StateEntry) -> DigestHash {
    let mut hasher = Sha256::new();
    hasher.update(entry.key.as_bytes());
    hasher.update([0u8]);
    hasher.update(entry.value.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(entry.version.to_be_bytes());
    hasher.finalize().into()
}
