//! Transaction id tree.
//!
//! Leaves are transaction records used for proof of innocence attestations. The tree keeps a reverse lookup from
//! transaction id to global position and, in authoritative mode, archives the root of every committed batch.
//!
//! Transactions created before the POI launch block are proven against the root that existed at launch. When the first
//! transaction at or past the launch block is queued, the position of the last leaf before it is recorded. Once that
//! leaf is committed its path is frozen in a [`PoiLaunchSnapshot`], so legacy proofs can be built without freezing the
//! live tree.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use zcash_encoding::Optional;

use crate::config::{OperatingMode, TxidTreeConfig};
use crate::error::{MerkletreeError, SnapshotError};
use crate::hash::{Node, hash_left_right, poseidon, zero};
use crate::merkletree::{HasHash, Merkletree, TreeKind};
use crate::proof::{MerkleProof, build_proof};
use crate::serialization::read_node;
use crate::store::{Database, KeyPath, TreePaths, WriteOp};
use crate::utxo::CommitmentPreimage;
use crate::validator::MerklerootValidator;
use crate::{TREE_DEPTH, global_position, tree_and_index};

const TXID_LOOKUP: &str = "txid-lookup";
const MERKLEROOTS: &str = "merkleroots";
const POI_LAUNCH_SNAPSHOT: &str = "poi-launch-snapshot";
const POI_LAUNCH_BOUNDARY: &str = "poi-launch-boundary";

/// Leaf record of the transaction id tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Transaction id
    pub txid: Node,
    /// Commitments created
    pub commitments: Vec<Node>,
    /// Nullifiers spent
    pub nullifiers: Vec<Node>,
    /// Hash of the bound parameters of the proof
    pub bound_params_hash: Node,
    /// Unshield preimage, if the transaction withdraws from the pool
    pub unshield: Option<CommitmentPreimage>,
    /// Commitment tree of the spent nullifiers
    pub utxo_tree_in: u32,
    /// Commitment tree of the created commitments
    pub utxo_tree_out: u32,
    /// Index of the first created commitment in `utxo_tree_out`
    pub utxo_batch_start_position_out: u64,
    /// Block the transaction was included in
    pub block_number: u64,
    /// Block timestamp, if known
    pub timestamp: Option<u64>,
}

impl HasHash for TransactionRecord {
    /// `poseidon(txid, utxo_tree_in, global position of the first created commitment)`
    fn hash(&self) -> Node {
        poseidon(&[
            self.txid,
            Node::from_u64(u64::from(self.utxo_tree_in)),
            Node::from_u64(global_position(
                self.utxo_tree_out,
                self.utxo_batch_start_position_out,
            )),
        ])
    }
}

/// Node hashes along the path of the last leaf before the POI launch block, captured once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoiLaunchSnapshot {
    /// Shard of the leaf
    pub tree: u32,
    /// Index of the leaf
    pub index: u64,
    /// Node hash at each level along the path, from the leaf to the root
    pub nodes: [Node; TREE_DEPTH + 1],
}

impl PoiLaunchSnapshot {
    /// Returns the root of the tree at launch.
    #[must_use]
    pub fn root(&self) -> Node {
        self.nodes[TREE_DEPTH]
    }
}

/// Position of the POI launch in the tree, recorded when the first launched transaction is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchBoundary {
    /// The first launched transaction is the first leaf, there is nothing to snapshot.
    NoLegacyLeaves,
    /// Global position of the last leaf before the launch block.
    LastLegacyLeaf(u64),
}

impl LaunchBoundary {
    fn serialized_version() -> u8 {
        0
    }

    fn read<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let _version = reader.read_u8()?;
        let last_legacy_leaf = Optional::read(&mut reader, |r| r.read_u64::<LittleEndian>())?;

        Ok(last_legacy_leaf.map_or(Self::NoLegacyLeaves, Self::LastLegacyLeaf))
    }

    fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_u8(Self::serialized_version())?;
        let last_legacy_leaf = match self {
            Self::NoLegacyLeaves => None,
            Self::LastLegacyLeaf(position) => Some(*position),
        };
        Optional::write(&mut writer, last_legacy_leaf, |w, position| {
            w.write_u64::<LittleEndian>(position)
        })
    }
}

/// Transaction id tree specialization.
#[derive(Debug, Default, Clone)]
pub struct TxidTree {
    config: TxidTreeConfig,
}

impl TxidTree {
    /// Constructs the specialization.
    #[must_use]
    pub fn new(config: TxidTreeConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &TxidTreeConfig {
        &self.config
    }
}

fn txid_lookup_path(paths: &TreePaths, txid: &Node) -> KeyPath {
    paths.side_index(TXID_LOOKUP).join(txid.to_bytes())
}

fn encode_position(position: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8);
    bytes
        .write_u64::<LittleEndian>(position)
        .expect("writing to a vec cannot fail");
    bytes
}

fn merkleroot_path(paths: &TreePaths, global_position: u64) -> KeyPath {
    paths.side_index(MERKLEROOTS).join_number(global_position)
}

impl TreeKind for TxidTree {
    type Leaf = TransactionRecord;

    const NAMESPACE: &'static str = "txid-merkletree-v1";

    const SIDE_INDEXES: &'static [&'static str] = &[TXID_LOOKUP, MERKLEROOTS];

    fn on_new_leaf_root(
        &self,
        paths: &TreePaths,
        tree: u32,
        start_index: u64,
        leaves: &[TransactionRecord],
        root: Node,
    ) -> Vec<WriteOp> {
        let mut ops = leaves
            .iter()
            .enumerate()
            .map(|(offset, leaf)| {
                let position = global_position(tree, start_index + offset as u64);
                WriteOp::Put(txid_lookup_path(paths, &leaf.txid), encode_position(position))
            })
            .collect::<Vec<_>>();
        if self.config.operating_mode == OperatingMode::Authoritative {
            let last_index = start_index + leaves.len() as u64 - 1;
            ops.push(WriteOp::Put(
                merkleroot_path(paths, global_position(tree, last_index)),
                root.to_bytes().to_vec(),
            ));
        }
        ops
    }

    fn on_leaves_removed(&self, paths: &TreePaths, removed: &[(u64, TransactionRecord)]) -> Vec<WriteOp> {
        let mut ops = removed
            .iter()
            .flat_map(|(position, leaf)| {
                [
                    WriteOp::Del(txid_lookup_path(paths, &leaf.txid)),
                    WriteOp::Del(merkleroot_path(paths, *position)),
                ]
            })
            .collect::<Vec<_>>();
        // a removed legacy leaf may be the recorded boundary
        if let Some(launch_block) = self.config.poi_launch_block
            && removed
                .iter()
                .any(|(_, leaf)| leaf.block_number < launch_block)
        {
            ops.push(WriteOp::Del(paths.side_index(POI_LAUNCH_BOUNDARY)));
        }
        ops
    }
}

/// Transaction id tree engine.
pub type TxidMerkletree<D, V> = Merkletree<TxidTree, D, V>;

impl<D, V> Merkletree<TxidTree, D, V>
where
    D: Database,
    V: MerklerootValidator,
{
    /// Queues transaction records at consecutive global positions after the last committed or queued leaf.
    ///
    /// When the first record at or past the POI launch block is queued, the position of the leaf before it is
    /// recorded as the launch boundary. Queueing never waits for commits, the snapshot is captured once the last
    /// leaf before launch has been committed.
    pub async fn queue_transactions(
        &self,
        records: Vec<TransactionRecord>,
    ) -> Result<(), MerkletreeError<D::Error>> {
        if records.is_empty() {
            return Ok(());
        }
        let position = self.next_write_position().await;

        if let Some(launch_block) = self.kind().config().poi_launch_block
            && let Some(split) = records
                .iter()
                .position(|record| record.block_number >= launch_block)
            && self.get_launch_boundary().await?.is_none()
        {
            let boundary = match (position + split as u64).checked_sub(1) {
                None => Some(LaunchBoundary::NoLegacyLeaves),
                Some(previous_position) => {
                    let previous_block = match split.checked_sub(1) {
                        Some(previous) => Some(records[previous].block_number),
                        None => self
                            .get_committed_or_queued_leaf(previous_position)
                            .await?
                            .map(|previous| previous.block_number),
                    };
                    match previous_block {
                        Some(block) if block < launch_block => {
                            Some(LaunchBoundary::LastLegacyLeaf(previous_position))
                        }
                        Some(_) => Some(LaunchBoundary::NoLegacyLeaves),
                        None => {
                            tracing::debug!(
                                "No leaf found at global position {previous_position}, POI launch boundary not recorded"
                            );
                            None
                        }
                    }
                }
            };
            if let Some(boundary) = boundary {
                let mut bytes = Vec::new();
                boundary.write(&mut bytes)?;
                self.db()
                    .put(self.paths().side_index(POI_LAUNCH_BOUNDARY), bytes)
                    .await
                    .map_err(MerkletreeError::StoreError)?;
                tracing::info!("Recorded POI launch boundary {boundary:?}");
            }
        }

        let (tree, index) =
            tree_and_index(position).ok_or(MerkletreeError::PositionOutOfRange(position))?;
        self.queue_leaves(tree, index, records).await;
        if self.kind().config().poi_launch_block.is_some() {
            self.get_poi_launch_snapshot().await?;
        }

        Ok(())
    }

    async fn get_launch_boundary(&self) -> Result<Option<LaunchBoundary>, MerkletreeError<D::Error>> {
        self.db()
            .get(&self.paths().side_index(POI_LAUNCH_BOUNDARY))
            .await
            .map_err(MerkletreeError::StoreError)?
            .map(|bytes| LaunchBoundary::read(&bytes[..]))
            .transpose()
            .map_err(MerkletreeError::SerializationError)
    }

    /// Builds the snapshot from the committed leaves up to and including `previous_position`.
    ///
    /// Subtrees left of the path are final once the leaf is committed and subtrees right of it are empty at launch,
    /// so the snapshot does not depend on leaves committed after it. Returns `None` while the leaf is still queued.
    async fn capture_poi_launch_snapshot(
        &self,
        previous_position: u64,
    ) -> Result<Option<PoiLaunchSnapshot>, MerkletreeError<D::Error>> {
        let (tree, index) = tree_and_index(previous_position)
            .ok_or(MerkletreeError::PositionOutOfRange(previous_position))?;
        let _guard = self.lock_tree(tree).await;
        if index >= self.get_tree_length(tree).await {
            return Ok(None);
        }

        let mut nodes = [Node::default(); TREE_DEPTH + 1];
        nodes[0] = self.get_node_hash(tree, 0, index).await?;
        for level in 0..TREE_DEPTH {
            let child = index >> level;
            nodes[level + 1] = if child & 1 == 0 {
                hash_left_right(&nodes[level], &zero(level))
            } else {
                hash_left_right(&self.get_node_hash(tree, level, child - 1).await?, &nodes[level])
            };
        }
        let snapshot = PoiLaunchSnapshot { tree, index, nodes };

        let mut bytes = Vec::new();
        snapshot.write(&mut bytes)?;
        self.db()
            .put(self.paths().side_index(POI_LAUNCH_SNAPSHOT), bytes)
            .await
            .map_err(MerkletreeError::StoreError)?;
        tracing::info!(
            "Captured POI launch snapshot at tree {tree} index {index}, root {}",
            snapshot.root()
        );

        Ok(Some(snapshot))
    }

    /// Returns the POI launch snapshot.
    ///
    /// If the launch boundary is known and the last leaf before launch has been committed since, the snapshot is
    /// captured first. Returns `None` when no snapshot can be captured yet.
    pub async fn get_poi_launch_snapshot(
        &self,
    ) -> Result<Option<PoiLaunchSnapshot>, MerkletreeError<D::Error>> {
        if let Some(bytes) = self
            .db()
            .get(&self.paths().side_index(POI_LAUNCH_SNAPSHOT))
            .await
            .map_err(MerkletreeError::StoreError)?
        {
            return Ok(Some(PoiLaunchSnapshot::read(&bytes[..])?));
        }

        match self.get_launch_boundary().await? {
            Some(LaunchBoundary::LastLegacyLeaf(previous_position)) => {
                self.capture_poi_launch_snapshot(previous_position).await
            }
            Some(LaunchBoundary::NoLegacyLeaves) | None => Ok(None),
        }
    }

    /// Builds an inclusion proof for a leaf committed before the POI launch, against the root at launch.
    ///
    /// Siblings on the snapshot path are taken from the snapshot, siblings after it are empty and siblings before it
    /// are unchanged since launch so are read from the live tree. Leaves of shards filled before the snapshot shard
    /// are proven against their live root.
    pub async fn get_proof_with_snapshot(
        &self,
        tree: u32,
        index: u64,
    ) -> Result<MerkleProof, MerkletreeError<D::Error>> {
        let Some(snapshot) = self.get_poi_launch_snapshot().await? else {
            return Err(match self.get_launch_boundary().await? {
                Some(LaunchBoundary::LastLegacyLeaf(global_position)) => {
                    SnapshotError::UnsettledLeaf { global_position }
                }
                Some(LaunchBoundary::NoLegacyLeaves) | None => SnapshotError::NotCaptured,
            }
            .into());
        };
        if tree < snapshot.tree {
            return self.get_merkle_proof(tree, index).await;
        }
        if tree > snapshot.tree || index > snapshot.index {
            return Err(SnapshotError::LeafAfterSnapshot { tree, index }.into());
        }

        let leaf = self.get_node_hash(tree, 0, index).await?;
        build_proof(index, leaf, snapshot.root(), move |level, sibling_index| async move {
            let path_index = snapshot.index >> level;
            if sibling_index == path_index {
                Ok(snapshot.nodes[level])
            } else if sibling_index > path_index {
                Ok(zero(level))
            } else {
                self.get_node_hash(tree, level, sibling_index).await
            }
        })
        .await
    }

    /// Returns the global position of the transaction `txid`.
    pub async fn get_global_position(
        &self,
        txid: &Node,
    ) -> Result<Option<u64>, MerkletreeError<D::Error>> {
        self.db()
            .get(&txid_lookup_path(self.paths(), txid))
            .await
            .map_err(MerkletreeError::StoreError)?
            .map(|bytes| (&bytes[..]).read_u64::<LittleEndian>())
            .transpose()
            .map_err(MerkletreeError::SerializationError)
    }

    /// Returns the record of the transaction `txid`.
    pub async fn get_transaction_by_txid(
        &self,
        txid: &Node,
    ) -> Result<Option<TransactionRecord>, MerkletreeError<D::Error>> {
        let Some(position) = self.get_global_position(txid).await? else {
            return Ok(None);
        };
        let (tree, index) =
            tree_and_index(position).ok_or(MerkletreeError::PositionOutOfRange(position))?;

        self.get_leaf(tree, index).await
    }

    /// Returns the last committed transaction record.
    pub async fn get_latest_transaction(
        &self,
    ) -> Result<Option<TransactionRecord>, MerkletreeError<D::Error>> {
        let Some(tree) = self.latest_tree().await else {
            return Ok(None);
        };
        let length = self.get_tree_length(tree).await;

        self.get_leaf(tree, length - 1).await
    }

    /// Returns the archived root after the leaf at `index` of `tree` was committed.
    ///
    /// Roots are archived in authoritative mode only, for the last leaf of each committed batch.
    pub async fn get_historical_merkleroot(
        &self,
        tree: u32,
        index: u64,
    ) -> Result<Option<Node>, MerkletreeError<D::Error>> {
        self.db()
            .get(&merkleroot_path(self.paths(), global_position(tree, index)))
            .await
            .map_err(MerkletreeError::StoreError)?
            .map(|bytes| read_node(&bytes[..]))
            .transpose()
            .map_err(MerkletreeError::SerializationError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(txid: u64, block_number: u64) -> TransactionRecord {
        TransactionRecord {
            txid: Node::from_u64(txid),
            commitments: vec![Node::from_u64(txid * 10)],
            nullifiers: Vec::new(),
            bound_params_hash: Node::default(),
            unshield: None,
            utxo_tree_in: 0,
            utxo_tree_out: 0,
            utxo_batch_start_position_out: txid,
            block_number,
            timestamp: None,
        }
    }

    #[test]
    fn leaf_hash_commits_to_output_position() {
        let first = record(1, 1);
        let mut moved = first.clone();
        moved.utxo_tree_out = 1;
        assert_ne!(first.hash(), moved.hash());

        let mut different_block = first.clone();
        different_block.block_number = 2;
        assert_eq!(first.hash(), different_block.hash());
    }

    #[test]
    fn authoritative_mode_archives_batch_roots() {
        let paths = TreePaths::new(TxidTree::NAMESPACE, crate::config::Chain::default());
        let leaves = vec![record(1, 1), record(2, 1)];
        let root = Node::from_u64(99);

        let client = TxidTree::default().on_new_leaf_root(&paths, 0, 4, &leaves, root);
        assert_eq!(client.len(), 2);
        assert_eq!(
            client[1],
            WriteOp::Put(txid_lookup_path(&paths, &leaves[1].txid), encode_position(5))
        );

        let authoritative = TxidTree::new(TxidTreeConfig {
            operating_mode: OperatingMode::Authoritative,
            poi_launch_block: None,
        })
        .on_new_leaf_root(&paths, 0, 4, &leaves, root);
        assert_eq!(
            authoritative.last(),
            Some(&WriteOp::Put(merkleroot_path(&paths, 5), root.to_bytes().to_vec()))
        );
    }
}
