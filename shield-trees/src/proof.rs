//! Module for merkle inclusion proof construction and verification.

use crate::TREE_DEPTH;
use crate::hash::{Node, hash_left_right};

/// Merkle inclusion proof of a single leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Leaf hash
    pub leaf: Node,
    /// Sibling hashes ordered from the leaf level to the level below the root
    pub elements: Vec<Node>,
    /// Leaf index, big-endian. Bit `n` selects whether the known node is the right operand at level `n`.
    pub indices: Node,
    /// Root the proof folds to
    pub root: Node,
}

/// Returns the indices of the sibling nodes required to prove the leaf at `index`, ordered from the leaf level up.
pub(crate) fn sibling_indices(index: u64) -> [u64; TREE_DEPTH] {
    let mut siblings = [0; TREE_DEPTH];
    let mut sibling_index = index ^ 1;
    for sibling in siblings.iter_mut() {
        *sibling = sibling_index;
        sibling_index = (sibling_index >> 1) ^ 1;
    }
    siblings
}

/// Builds a proof for the leaf at `index` by resolving each sibling with `node_hash`.
///
/// `node_hash` is called with `(level, index)` and is expected to fall back to the level's zero value for nodes that
/// were never written.
pub(crate) async fn build_proof<F, Fut, E>(
    index: u64,
    leaf: Node,
    root: Node,
    mut node_hash: F,
) -> Result<MerkleProof, E>
where
    F: FnMut(usize, u64) -> Fut,
    Fut: std::future::Future<Output = Result<Node, E>>,
{
    let mut elements = Vec::with_capacity(TREE_DEPTH);
    for (level, sibling_index) in sibling_indices(index).into_iter().enumerate() {
        elements.push(node_hash(level, sibling_index).await?);
    }

    Ok(MerkleProof {
        leaf,
        elements,
        indices: Node::from_u64(index),
        root,
    })
}

/// Folds the proof elements onto the leaf and compares the result with the proof root.
#[must_use]
pub fn verify_proof(proof: &MerkleProof) -> bool {
    if proof.elements.len() != TREE_DEPTH {
        return false;
    }
    let indices = proof.indices.as_bytes();
    if indices[..24].iter().any(|byte| *byte != 0) {
        return false;
    }
    let mut index_bytes = [0u8; 8];
    index_bytes.copy_from_slice(&indices[24..]);
    let index = u64::from_be_bytes(index_bytes);
    if index >> TREE_DEPTH != 0 {
        return false;
    }

    let computed_root = proof
        .elements
        .iter()
        .enumerate()
        .fold(proof.leaf, |current, (level, element)| {
            if (index >> level) & 1 == 0 {
                hash_left_right(&current, element)
            } else {
                hash_left_right(element, &current)
            }
        });

    computed_root == proof.root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::zero;

    #[test]
    fn sibling_indices_walk_towards_the_root() {
        let siblings = sibling_indices(5);
        assert_eq!(siblings[0], 4);
        assert_eq!(siblings[1], 3);
        assert_eq!(siblings[2], 0);
        assert_eq!(siblings[3], 1);
    }

    async fn empty_tree_proof(index: u64, leaf: Node) -> MerkleProof {
        let mut root = leaf;
        for level in 0..TREE_DEPTH {
            root = if (index >> level) & 1 == 0 {
                hash_left_right(&root, &zero(level))
            } else {
                hash_left_right(&zero(level), &root)
            };
        }
        build_proof::<_, _, std::convert::Infallible>(index, leaf, root, |level, _| async move {
            Ok(zero(level))
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn single_leaf_proof_verifies() {
        let proof = empty_tree_proof(3, Node::from_u64(9)).await;
        assert!(verify_proof(&proof));
    }

    #[tokio::test]
    async fn tampered_proofs_fail() {
        let proof = empty_tree_proof(6, Node::from_u64(42)).await;

        let mut wrong_root = proof.clone();
        wrong_root.root = Node::from_u64(1);
        assert!(!verify_proof(&wrong_root));

        let mut wrong_indices = proof.clone();
        wrong_indices.indices = Node::from_u64(7);
        assert!(!verify_proof(&wrong_indices));

        let mut wrong_element = proof.clone();
        wrong_element.elements[4] = Node::from_u64(1);
        assert!(!verify_proof(&wrong_element));

        let mut short = proof;
        short.elements.pop();
        assert!(!verify_proof(&short));
    }
}
