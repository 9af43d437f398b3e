//! Binary Merkle tree over an ordered list of string leaves.
//!
//! Behavior:
//! - A leaf's hash is the SHA-256 of the leaf's UTF-8 bytes.
//! - A parent's hash is the SHA-256 of the 64 raw bytes `left || right`.
//! - Odd levels pair the last node with itself; the parent's right child is
//!   the same `Arc` as its left child.
//! - A single leaf is its own root. An empty leaf list is an error.
//!
//! Verification rebuilds the whole tree from every leaf. There are no
//! inclusion proofs: proving one leaf requires supplying all of them.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur when building a Merkle tree
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MerkleError {
    #[error("No leaf hashes provided")]
    EmptyLeafSet,
}

type Digest32 = [u8; 32];

/// A node of the tree
#[derive(Debug, PartialEq, Eq)]
pub enum MerkleNode {
    Leaf {
        hash: Digest32,
    },
    Internal {
        hash: Digest32,
        left: Arc<MerkleNode>,
        right: Arc<MerkleNode>,
    },
}

impl MerkleNode {
    fn leaf(data: &str) -> Self {
        MerkleNode::Leaf {
            hash: Sha256::digest(data.as_bytes()).into(),
        }
    }

    fn parent(left: Arc<MerkleNode>, right: Arc<MerkleNode>) -> Self {
        let hash = Sha256::new()
            .chain_update(left.hash())
            .chain_update(right.hash())
            .finalize()
            .into();

        MerkleNode::Internal { hash, left, right }
    }

    /// Raw digest of this node
    pub fn hash(&self) -> &Digest32 {
        match self {
            MerkleNode::Leaf { hash } | MerkleNode::Internal { hash, .. } => hash,
        }
    }

    /// Hex-encoded digest of this node
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }
}

/// A built Merkle tree
#[derive(Debug, Clone)]
pub struct MerkleTree {
    root: Arc<MerkleNode>,
    leaf_count: usize,
}

impl MerkleTree {
    /// Builds the tree bottom-up, level by level
    pub fn build<I, S>(leaves: I) -> Result<Self, MerkleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut level: Vec<Arc<MerkleNode>> = leaves
            .into_iter()
            .map(|leaf| Arc::new(MerkleNode::leaf(leaf.as_ref())))
            .collect();

        if level.is_empty() {
            return Err(MerkleError::EmptyLeafSet);
        }
        let leaf_count = level.len();

        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| {
                    let left = Arc::clone(&pair[0]);
                    let right = pair.get(1).map_or_else(|| Arc::clone(&left), Arc::clone);
                    Arc::new(MerkleNode::parent(left, right))
                })
                .collect();
        }

        let root = level.pop().ok_or(MerkleError::EmptyLeafSet)?;
        Ok(MerkleTree { root, leaf_count })
    }

    /// Hex-encoded root hash
    pub fn root_hash(&self) -> String {
        self.root.hash_hex()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Rebuilds the tree from `leaves` and compares its root to `claimed_root`
    ///
    /// The comparison ignores surrounding whitespace and hex letter case.
    pub fn verify<I, S>(claimed_root: &str, leaves: I) -> Result<bool, MerkleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let computed = Self::build(leaves)?.root_hash();
        Ok(computed.eq_ignore_ascii_case(claimed_root.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::codec;

    const X: &str = "2d711642b726b04401627ca9fbac32f5c8530fb1903cc4db02258717921a4881";
    const Y: &str = "a1fce4363854ff888cff4b8e7875d600c2682390412a8cf79b37d0b11148b0fa";
    const Z: &str = "594e519ae499312b29433b7dd8a97ff068defcba9755b6d5d00e84c524d67b06";

    fn combine(left: &str, right: &str) -> String {
        let bytes = hex::decode(format!("{}{}", left, right)).unwrap();
        codec::digest(&bytes)
    }

    #[test]
    fn test_empty_leaf_set() {
        let leaves: Vec<String> = Vec::new();
        assert_eq!(MerkleTree::build(&leaves).unwrap_err(), MerkleError::EmptyLeafSet);
        assert_eq!(
            MerkleTree::verify(X, &leaves),
            Err(MerkleError::EmptyLeafSet)
        );
    }

    #[test]
    fn test_single_leaf_is_root() {
        let tree = MerkleTree::build(["x"]).unwrap();

        assert!(matches!(*tree.root, MerkleNode::Leaf { .. }));
        assert_eq!(tree.root_hash(), X);
        assert_eq!(tree.leaf_count(), 1);
    }

    #[test]
    fn test_two_leaves() {
        let tree = MerkleTree::build(["a", "b"]).unwrap();
        assert_eq!(
            tree.root_hash(),
            "e5a01fee14e0ed5c48714f22180f25ad8365b53f9779f79dc4a3d7e93963f94a"
        );
    }

    #[test]
    fn test_odd_level_duplicates_last_node() {
        let tree = MerkleTree::build(["x", "y", "z"]).unwrap();

        assert_eq!(
            tree.root_hash(),
            "94ee69041d6a31c76688b1da2c00896986f218040c9b41f7118de0b4ee80db98"
        );
        assert_eq!(tree.root_hash(), combine(&combine(X, Y), &combine(Z, Z)));

        let right = match &*tree.root {
            MerkleNode::Internal { right, .. } => right,
            MerkleNode::Leaf { .. } => panic!("root of three leaves is a leaf"),
        };
        match &**right {
            MerkleNode::Internal { left, right, .. } => {
                assert!(Arc::ptr_eq(left, right));
                assert_eq!(left.hash_hex(), Z);
            }
            MerkleNode::Leaf { .. } => panic!("right subtree is a leaf"),
        }
    }

    #[test]
    fn test_verify_round_trip() {
        let leaves = vec!["alpha", "beta", "gamma", "delta", "epsilon"];
        let root = MerkleTree::build(&leaves).unwrap().root_hash();

        assert!(MerkleTree::verify(&root, &leaves).unwrap());
        assert!(MerkleTree::verify(&root.to_uppercase(), &leaves).unwrap());
    }

    #[test]
    fn test_changed_leaf_fails_verification() {
        let leaves = vec!["alpha", "beta", "gamma", "delta"];
        let root = MerkleTree::build(&leaves).unwrap().root_hash();

        for i in 0..leaves.len() {
            let mut changed = leaves.clone();
            changed[i] = "tampered";
            assert_ne!(MerkleTree::build(&changed).unwrap().root_hash(), root);
            assert!(!MerkleTree::verify(&root, &changed).unwrap());
        }
    }

    #[test]
    fn test_leaf_order_matters() {
        let forward = MerkleTree::build(["a", "b"]).unwrap().root_hash();
        let reversed = MerkleTree::build(["b", "a"]).unwrap().root_hash();
        assert_ne!(forward, reversed);
    }
}
