//! Binary Keccak Merkle tree over batch leaves
//!
//! Leaf order is batch insertion order. When a level has an odd number of
//! nodes the last node is duplicated, so a lone sibling hashes against
//! itself. The on-chain verifier applies the same rule; any other padding
//! convention would produce a root the contract rejects.

use serde::{Deserialize, Serialize};

use super::hash::{keccak, Hash256};

/// Inclusion proof for one leaf: the sibling hashes from the leaf level up.
///
/// `index` locates the leaf; its bits, read low to high, decide on which
/// side each sibling is hashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub siblings: Vec<Hash256>,
    pub index: usize,
}

impl MerkleProof {
    /// Recompute the root implied by `leaf` under this proof.
    pub fn root_for(&self, leaf: &Hash256) -> Hash256 {
        let mut node = *leaf;
        let mut index = self.index;
        for sibling in &self.siblings {
            node = if index & 1 == 0 {
                hash_pair(&node, sibling)
            } else {
                hash_pair(sibling, &node)
            };
            index >>= 1;
        }
        node
    }

    /// Verify this proof links `leaf` to `root`.
    pub fn verify(&self, leaf: &Hash256, root: &Hash256) -> bool {
        self.root_for(leaf) == *root
    }
}

/// A fully materialized tree; built once per sealed batch, queried for the
/// root and one proof per entry.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// levels[0] is the leaf level, last level holds the single root.
    levels: Vec<Vec<Hash256>>,
}

fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut preimage = [0u8; 64];
    preimage[..32].copy_from_slice(left);
    preimage[32..].copy_from_slice(right);
    keccak(&preimage)
}

impl MerkleTree {
    /// Build the tree from leaves in order. Returns `None` for an empty
    /// batch, which must never be sealed.
    pub fn build(leaves: &[Hash256]) -> Option<Self> {
        if leaves.is_empty() {
            return None;
        }

        let mut levels = vec![leaves.to_vec()];
        while levels.last().map(Vec::len) > Some(1) {
            let current = levels.last().expect("levels is non-empty");
            let mut parents = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = &pair[0];
                // Odd node count: the last node pairs with itself.
                let right = pair.get(1).unwrap_or(left);
                parents.push(hash_pair(left, right));
            }
            levels.push(parents);
        }

        Some(Self { levels })
    }

    pub fn root(&self) -> Hash256 {
        self.levels[self.levels.len() - 1][0]
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Inclusion proof for the leaf at `index` (insertion order).
    pub fn prove(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count() {
            return None;
        }

        let mut siblings = Vec::with_capacity(self.levels.len() - 1);
        let mut position = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_position = position ^ 1;
            // Past the end means this node was duplicated at this level.
            let sibling = level.get(sibling_position).unwrap_or(&level[position]);
            siblings.push(*sibling);
            position >>= 1;
        }

        Some(MerkleProof { siblings, index })
    }
}
