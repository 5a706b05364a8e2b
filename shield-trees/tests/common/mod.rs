#![allow(dead_code)]

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use shield_trees::config::{Chain, MerkletreeConfig, PerformanceLevel};
use shield_trees::error::ValidatorError;
use shield_trees::hash::{hash_left_right, zero};
use shield_trees::{HasHash, LeafData, MemoryDatabase, Merkletree, MerklerootValidator, Node, TreeKind};

/// Leaf carrying only its hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestLeaf(pub Node);

impl HasHash for TestLeaf {
    fn hash(&self) -> Node {
        self.0
    }
}

impl LeafData for TestLeaf {
    fn read<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut bytes = [0u8; 32];
        reader.read_exact(&mut bytes)?;
        Ok(Self(Node::from_bytes(bytes)))
    }

    fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(self.0.as_bytes())
    }
}

/// Tree kind without side indexes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TestTree;

impl TreeKind for TestTree {
    type Leaf = TestLeaf;

    const NAMESPACE: &'static str = "test-merkletree";
}

/// Validator whose authority can be taken offline. Accepts every root while online.
#[derive(Debug, Default, Clone)]
pub struct FlakyValidator {
    pub offline: Arc<AtomicBool>,
    pub calls: Arc<AtomicUsize>,
}

impl MerklerootValidator for FlakyValidator {
    async fn validate(
        &self,
        _chain: Chain,
        _tree: u32,
        _last_index: u64,
        _root: Node,
    ) -> Result<bool, ValidatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(ValidatorError::new("merkleroot authority unreachable"));
        }
        Ok(true)
    }
}

pub type TestMerkletree<V> = Merkletree<TestTree, MemoryDatabase, V>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn leaves(range: std::ops::Range<u64>) -> Vec<TestLeaf> {
    range.map(|value| TestLeaf(Node::from_u64(value + 1))).collect()
}

pub async fn test_tree<V: MerklerootValidator>(
    performance_level: PerformanceLevel,
    validator: V,
) -> TestMerkletree<V> {
    init_tracing();
    Merkletree::new(
        Chain::default(),
        MerkletreeConfig { performance_level },
        TestTree,
        Arc::new(MemoryDatabase::new()),
        validator,
    )
    .await
    .unwrap()
}

/// Root of a shard holding `hashes` from index 0, computed without the engine.
pub fn reference_root(hashes: &[Node]) -> Node {
    let mut level_nodes = hashes.to_vec();
    for level in 0..shield_trees::TREE_DEPTH {
        if level_nodes.len() % 2 == 1 {
            level_nodes.push(zero(level));
        }
        if level_nodes.is_empty() {
            return zero(shield_trees::TREE_DEPTH);
        }
        level_nodes = level_nodes
            .chunks_exact(2)
            .map(|pair| hash_left_right(&pair[0], &pair[1]))
            .collect();
    }
    level_nodes[0]
}
