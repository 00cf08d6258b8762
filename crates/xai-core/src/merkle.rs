//! SHA-256 merkle tree over transaction IDs.
//!
//! The root is computed by repeated pairwise SHA-256 over the txid layer,
//! duplicating the tail entry when a layer has odd length. A single-leaf
//! tree's root is the leaf itself; the empty tree's root is
//! [`Hash256::ZERO`].

use crate::types::Hash256;
use sha2::{Digest, Sha256};

/// Hash a pair of nodes: `SHA256(left || right)`.
pub fn pair_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Compute the merkle root from a slice of txids.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }
    let mut current = leaves.to_vec();
    while current.len() > 1 {
        current = next_layer(&current);
    }
    current[0]
}

fn next_layer(layer: &[Hash256]) -> Vec<Hash256> {
    let mut next = Vec::with_capacity(layer.len().div_ceil(2));
    let mut i = 0;
    while i < layer.len() {
        let left = &layer[i];
        let right = if i + 1 < layer.len() { &layer[i + 1] } else { left };
        next.push(pair_hash(left, right));
        i += 2;
    }
    next
}

/// One step of an inclusion proof: the sibling hash and whether it sits to
/// the right of the running hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: Hash256,
    pub sibling_is_right: bool,
}

/// An inclusion proof for a single leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleProof {
    pub leaf: Hash256,
    pub steps: Vec<ProofStep>,
}

impl MerkleProof {
    /// Replay the proof and check it reaches `root`.
    pub fn verify(&self, root: &Hash256) -> bool {
        let mut acc = self.leaf;
        for step in &self.steps {
            acc = if step.sibling_is_right {
                pair_hash(&acc, &step.sibling)
            } else {
                pair_hash(&step.sibling, &acc)
            };
        }
        acc == *root
    }
}

/// Full merkle tree retaining all layers for proof extraction.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    /// `layers[0]` = leaves, `layers[last]` = `[root]`.
    layers: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    pub fn from_leaves(leaves: &[Hash256]) -> Self {
        if leaves.is_empty() {
            return Self { layers: Vec::new() };
        }
        let mut layers = vec![leaves.to_vec()];
        while layers.last().unwrap().len() > 1 {
            let next = next_layer(layers.last().unwrap());
            layers.push(next);
        }
        Self { layers }
    }

    /// The merkle root. [`Hash256::ZERO`] for an empty tree.
    pub fn root(&self) -> Hash256 {
        self.layers
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or(Hash256::ZERO)
    }

    pub fn leaf_count(&self) -> usize {
        self.layers.first().map_or(0, |l| l.len())
    }

    /// Generate an inclusion proof for the leaf at `index`.
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        let leaves = self.layers.first()?;
        if index >= leaves.len() {
            return None;
        }

        let mut steps = Vec::new();
        let mut pos = index;
        for layer in &self.layers[..self.layers.len() - 1] {
            let sibling_pos = pos ^ 1;
            // Odd tail duplicates itself as its own sibling.
            let sibling = if sibling_pos < layer.len() {
                layer[sibling_pos]
            } else {
                layer[pos]
            };
            steps.push(ProofStep {
                sibling,
                sibling_is_right: sibling_pos > pos || sibling_pos >= layer.len(),
            });
            pos /= 2;
        }

        Some(MerkleProof { leaf: leaves[index], steps })
    }
}
