//! Traits for interfacing the tree engine with an ordered key-value store.
//!
//! Keys are sequences of fixed width 32 byte segments. Numeric segments are big-endian and right aligned so the
//! lexicographic order of encoded keys matches the numeric order of each segment, which range scans rely on.

use std::future::Future;

use futures::Stream;

use crate::config::Chain;
use crate::hash::Node;

pub mod memory;

pub use memory::MemoryDatabase;

/// Width of every key segment in bytes.
pub const SEGMENT_LENGTH: usize = 32;

/// A single fixed width key segment.
pub type Segment = [u8; SEGMENT_LENGTH];

/// Returns a segment holding `value`, big-endian and right aligned.
#[must_use]
pub fn number_segment(value: u64) -> Segment {
    Node::from_u64(value).to_bytes()
}

/// Returns a segment holding the ascii `label`, left aligned and zero padded.
///
/// Panics if `label` is longer than [`SEGMENT_LENGTH`].
#[must_use]
pub fn label_segment(label: &str) -> Segment {
    assert!(
        label.len() <= SEGMENT_LENGTH,
        "label {label} does not fit in a key segment"
    );
    let mut segment = [0u8; SEGMENT_LENGTH];
    segment[..label.len()].copy_from_slice(label.as_bytes());
    segment
}

/// Key of a value in the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyPath(Vec<Segment>);

impl KeyPath {
    /// Constructs a key from its segments.
    #[must_use]
    pub fn new(segments: Vec<Segment>) -> Self {
        Self(segments)
    }

    /// Returns a new key with `segment` appended.
    #[must_use]
    pub fn join(&self, segment: Segment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    /// Returns a new key with a numeric segment appended.
    #[must_use]
    pub fn join_number(&self, value: u64) -> Self {
        self.join(number_segment(value))
    }

    /// Returns a new key with a label segment appended.
    #[must_use]
    pub fn join_label(&self, label: &str) -> Self {
        self.join(label_segment(label))
    }

    /// Returns the key segments.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Encodes the key as the concatenation of its segments.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.0.concat()
    }

    /// Decodes a key encoded with [`Self::encode`]. Returns `None` if `bytes` is not a whole number of segments.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % SEGMENT_LENGTH != 0 {
            return None;
        }
        Some(Self(
            bytes
                .chunks_exact(SEGMENT_LENGTH)
                .map(|chunk| {
                    let mut segment = [0u8; SEGMENT_LENGTH];
                    segment.copy_from_slice(chunk);
                    segment
                })
                .collect(),
        ))
    }

    /// Returns the last segment as a number, if it is a numeric segment.
    #[must_use]
    pub fn last_number(&self) -> Option<u64> {
        let segment = self.0.last()?;
        if segment[..24].iter().any(|byte| *byte != 0) {
            return None;
        }
        let mut value = [0u8; 8];
        value.copy_from_slice(&segment[24..]);
        Some(u64::from_be_bytes(value))
    }
}

/// A single write in an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite the value at a key.
    Put(KeyPath, Vec<u8>),
    /// Remove the value at a key.
    Del(KeyPath),
}

/// Trait for interfacing the tree engine with an ordered key-value store.
///
/// Every method may suspend. Retries of transient failures are the responsibility of the implementation.
pub trait Database: Send + Sync {
    /// Errors associated with store access
    type Error: std::fmt::Debug + std::fmt::Display + std::error::Error + Send + Sync + 'static;

    /// Returns the value at `path` or `None` if no value is stored.
    fn get(
        &self,
        path: &KeyPath,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    /// Stores `value` at `path`.
    fn put(
        &self,
        path: KeyPath,
        value: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Removes the value at `path`. Removing a missing value is not an error.
    fn del(&self, path: &KeyPath) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Applies all `ops` or none of them.
    fn batch(&self, ops: Vec<WriteOp>) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Streams every entry with a key in `start..end` in ascending key order.
    fn stream_range(
        &self,
        start: KeyPath,
        end: KeyPath,
    ) -> impl Stream<Item = Result<(KeyPath, Vec<u8>), Self::Error>> + Send;

    /// Returns the number of entries with a key starting with `prefix`.
    fn count_namespace(
        &self,
        prefix: &KeyPath,
    ) -> impl Future<Output = Result<usize, Self::Error>> + Send;

    /// Removes every entry with a key starting with `prefix`.
    fn clear_namespace(
        &self,
        prefix: &KeyPath,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Streams every entry with a key starting with `prefix` in ascending key order.
    fn stream_namespace(
        &self,
        prefix: &KeyPath,
    ) -> impl Stream<Item = Result<(KeyPath, Vec<u8>), Self::Error>> + Send {
        self.stream_range(prefix.clone(), prefix.join([0xff; SEGMENT_LENGTH]))
    }
}

/// Numeric segment marking the leaf record namespace of a shard. Sorts after every node level.
const DATA_SEGMENT: u64 = u64::MAX - 1;
/// Numeric segment marking the metadata of a shard.
const METADATA_SEGMENT: u64 = u64::MAX;

/// Builds the key paths of a single tree kind on a single chain.
///
/// Shard data lives under `[namespace, chain, tree, ..]`. Side indexes of a specialization live under
/// `[namespace, chain, label, ..]`.
#[derive(Debug, Clone)]
pub struct TreePaths {
    root: KeyPath,
}

impl TreePaths {
    pub(crate) fn new(namespace: &str, chain: Chain) -> Self {
        Self {
            root: KeyPath::new(vec![label_segment(namespace), chain.segment()]),
        }
    }

    /// Prefix of everything stored for this tree kind.
    #[must_use]
    pub fn root(&self) -> &KeyPath {
        &self.root
    }

    /// Prefix of everything stored for shard `tree`.
    #[must_use]
    pub fn tree(&self, tree: u32) -> KeyPath {
        self.root.join_number(u64::from(tree))
    }

    /// Prefix of the node hashes of `level` in shard `tree`.
    #[must_use]
    pub fn level(&self, tree: u32, level: usize) -> KeyPath {
        self.tree(tree).join_number(level as u64)
    }

    /// Key of a node hash.
    #[must_use]
    pub fn node(&self, tree: u32, level: usize, index: u64) -> KeyPath {
        self.level(tree, level).join_number(index)
    }

    /// Prefix of the leaf records of shard `tree`.
    #[must_use]
    pub fn data_prefix(&self, tree: u32) -> KeyPath {
        self.tree(tree).join_number(DATA_SEGMENT)
    }

    /// Key of a leaf record.
    #[must_use]
    pub fn data(&self, tree: u32, index: u64) -> KeyPath {
        self.data_prefix(tree).join_number(index)
    }

    /// Key of the metadata of shard `tree`.
    #[must_use]
    pub fn metadata(&self, tree: u32) -> KeyPath {
        self.tree(tree).join_number(METADATA_SEGMENT)
    }

    /// Prefix of a specialization side index.
    #[must_use]
    pub fn side_index(&self, label: &str) -> KeyPath {
        self.root.join_label(label)
    }
}
