//! Tree engine error module

use crate::hash::Node;

/// Top level error enumerating any error that may occur while maintaining a tree
#[derive(Debug, thiserror::Error)]
pub enum MerkletreeError<E>
where
    E: std::fmt::Debug + std::fmt::Display,
{
    /// Computed root rejected by the merkleroot validator.
    #[error("invalid merkleroot {root} for tree {tree} at index {last_index}")]
    InvalidMerkleroot {
        /// Shard
        tree: u32,
        /// Index of the last leaf of the rejected group
        last_index: u64,
        /// Rejected root
        root: Node,
    },
    /// Consistency error.
    #[error("consistency error. {0}")]
    ConsistencyError(#[from] ConsistencyError),
    /// Validator error.
    #[error("validator error. {0}")]
    ValidatorError(#[from] ValidatorError),
    /// Snapshot error.
    #[error("snapshot error. {0}")]
    SnapshotError(#[from] SnapshotError),
    /// Serialization error.
    #[error("serialization error. {0}")]
    SerializationError(#[from] std::io::Error),
    /// Shard has no room for more leaves.
    #[error("tree {tree} is full")]
    TreeFull {
        /// Shard
        tree: u32,
    },
    /// Global position past the last addressable shard.
    #[error("global position {0} is out of range")]
    PositionOutOfRange(u64),
    /// Store error.
    #[error("store error. {0}")]
    StoreError(E),
}

impl<E> MerkletreeError<E>
where
    E: std::fmt::Debug + std::fmt::Display,
{
    /// Returns `true` if the error is a rejected root, the only error the commit loop retries.
    #[must_use]
    pub fn is_invalid_merkleroot(&self) -> bool {
        matches!(self, Self::InvalidMerkleroot { .. })
    }
}

/// Errors raised when local state diverges from the append-only invariants.
#[derive(Debug, thiserror::Error)]
pub enum ConsistencyError {
    /// A committed leaf would be overwritten with a different hash.
    #[error("leaf {index} of tree {tree} is committed as {committed} but {attempted} was written")]
    LeafMismatch {
        /// Shard
        tree: u32,
        /// Leaf index
        index: u64,
        /// Committed hash
        committed: Node,
        /// Attempted hash
        attempted: Node,
    },
    /// A leaf record update does not match the hash committed at its slot.
    #[error("leaf record hash {attempted} does not match committed hash {committed} at tree {tree} index {index}")]
    DataHashMismatch {
        /// Shard
        tree: u32,
        /// Leaf index
        index: u64,
        /// Committed hash
        committed: Node,
        /// Attempted hash
        attempted: Node,
    },
    /// Leaves were written past the committed length of a shard.
    #[error("write at index {start_index} of tree {tree} leaves a gap after length {length}")]
    WriteGap {
        /// Shard
        tree: u32,
        /// Committed length
        length: u64,
        /// Start of the write
        start_index: u64,
    },
    /// Leaf record update at a slot that was never committed.
    #[error("no leaf committed at tree {tree} index {index}")]
    LeafNotCommitted {
        /// Shard
        tree: u32,
        /// Leaf index
        index: u64,
    },
}

/// POI launch snapshot errors.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// No snapshot has been captured.
    #[error("POI launch snapshot has not been captured")]
    NotCaptured,
    /// The requested leaf was committed after the snapshot.
    #[error("leaf at tree {tree} index {index} is not covered by the POI launch snapshot")]
    LeafAfterSnapshot {
        /// Shard
        tree: u32,
        /// Leaf index
        index: u64,
    },
    /// The last leaf before the launch block is not committed yet.
    #[error("leaf at global position {global_position} is not committed, snapshot cannot be captured")]
    UnsettledLeaf {
        /// Global position of the last leaf before the launch block
        global_position: u64,
    },
}

/// Error returned by a merkleroot validator that could not reach a verdict.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ValidatorError(pub Box<dyn std::error::Error + Send + Sync>);

impl ValidatorError {
    /// Wraps any error returned by a validator.
    pub fn new<T>(error: T) -> Self
    where
        T: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self(error.into())
    }
}
