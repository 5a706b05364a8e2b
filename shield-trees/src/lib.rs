#![warn(missing_docs)]
#![allow(clippy::result_large_err)]
#![doc = r#"
# Shield Trees

## Overview
Shield-trees is a rust-based merkle tree engine for clients of a shielded pool. It keeps local replicas of the
on-chain commitment accumulator and of the transaction id accumulator byte-for-byte consistent with the roots anchored
on chain and provides the following features:
- Incremental insertion, only the ancestors of newly written leaves are re-hashed. Untouched subtrees are read from
  the node cache, the store or the zero value of their level.
- Write queue, leaves may be queued in any order and are only committed once they are contiguous with the tree length.
- Adaptive batching, batches are committed in groups that step down a fixed ladder of group sizes whenever the
  merkleroot validator rejects a computed root. This isolates the first bad leaf while keeping every leaf before it.
- Concurrent shards, the write queue of each shard is drained concurrently while commits to a single shard are
  strictly ordered.
- Rollback, all leaves after a given position can be removed and the affected shard rebuilt from its leaf records.
- POI launch snapshot, the transaction id tree freezes the path of the last leaf before a configured launch block so
  proofs for legacy transactions can be built against the root that existed at launch.

## Terminology
- Shard / tree - one fixed capacity merkle tree of [`TREE_MAX_ITEMS`] leaves and depth [`TREE_DEPTH`].
- Global position - shard spanning leaf index, `tree * TREE_MAX_ITEMS + index`.
- Tree length - number of committed leaves in a shard, persisted as the shard's scanned height.
- Zero value - hash of an empty subtree at a given level.
- Merkleroot validator - external authority confirming that a locally computed root matches the chain.
- Snapshot - the per-level node hashes along the path of the last leaf before the POI launch block.

## Commit
1. The scanner queues batches of leaves with [`merkletree::Merkletree::queue_leaves`]. Batches starting before the
   tree length are discarded as already applied.
2. A driver calls [`merkletree::Merkletree::update_trees_from_write_queue`]. Each shard with pending batches is
   processed concurrently.
3. For each shard, contiguous queued leaves are gathered up to the current group size and inserted:
  3a. Leaf hashes are written at level 0 and every ancestor is recomputed up to the root.
  3b. The root is sent to the merkleroot validator.
  3c. If the root is valid, node hashes, leaf records, side indexes and the new tree length are written in a single
      atomic batch.
  3d. If the root is invalid, the invalid root is recorded and the group size steps down the ladder. When the ladder
      is exhausted the shard stops for this pass, leaving the offending leaf queued.

## Rollback
[`merkletree::Merkletree::clear_leaves_after_position`] removes every leaf after the given global position, prunes the
specialization side indexes and rebuilds the truncated shard from its leaf records so the root matches the root that
existed before the removed leaves were committed.
"#]

pub mod config;
pub mod error;
pub mod hash;
pub mod merkletree;
pub mod proof;
pub(crate) mod serialization;
pub mod store;
pub mod txid;
pub mod utxo;
pub mod validator;

pub use hash::Node;
pub use merkletree::{HasHash, LeafData, Merkletree, TreeKind};
pub use proof::{MerkleProof, verify_proof};
pub use store::{Database, MemoryDatabase};
pub use txid::{TransactionRecord, TxidMerkletree, TxidTree};
pub use utxo::{Commitment, UtxoMerkletree, UtxoTree};
pub use validator::{AcceptAll, MerklerootValidator};

/// Depth of every shard. Level 0 holds the leaves and level [`TREE_DEPTH`] holds the root.
pub const TREE_DEPTH: usize = 16;

/// Maximum number of leaves in a single shard.
pub const TREE_MAX_ITEMS: u64 = 1 << TREE_DEPTH;

/// Returns the shard spanning position of the leaf at `index` of shard `tree`.
///
/// ```
/// assert_eq!(shield_trees::global_position(1, 2), 65_538);
/// ```
#[must_use]
pub fn global_position(tree: u32, index: u64) -> u64 {
    u64::from(tree) * TREE_MAX_ITEMS + index
}

/// Splits a global position into its shard and index. Returns `None` for positions past the last addressable shard.
///
/// ```
/// assert_eq!(shield_trees::tree_and_index(65_538), Some((1, 2)));
/// assert_eq!(shield_trees::tree_and_index(u64::MAX), None);
/// ```
#[must_use]
pub fn tree_and_index(global_position: u64) -> Option<(u32, u64)> {
    let tree = u32::try_from(global_position / TREE_MAX_ITEMS).ok()?;
    Some((tree, global_position % TREE_MAX_ITEMS))
}
