//! Generic incremental merkle tree engine.
//!
//! The engine is generic over a [`TreeKind`], which names the leaf record type, the persisted namespace and the
//! extension hooks of a specialization. Node hashes, leaf records and shard metadata of every shard are kept in a
//! [`Database`], with node hashes also cached in memory once committed.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::pin::pin;
use std::sync::Arc;

use futures::TryStreamExt;
use tokio::sync::{Mutex, RwLock};

use crate::config::{Chain, MerkletreeConfig};
use crate::error::{ConsistencyError, MerkletreeError};
use crate::hash::{Node, hash_left_right, zero};
use crate::proof::{MerkleProof, build_proof};
use crate::serialization::{read_node, write_node};
use crate::store::{Database, KeyPath, TreePaths, WriteOp};
use crate::validator::MerklerootValidator;
use crate::{TREE_DEPTH, TREE_MAX_ITEMS, global_position, tree_and_index};

use lock::{ShardGuard, ShardLocks};
use queue::{WriteQueue, split_at_shard_boundaries};

pub(crate) mod lock;
pub(crate) mod queue;

/// Group sizes the commit loop steps down through when a root is rejected. Strictly decreasing, ending at 1.
pub const GROUP_SIZE_LADDER: [usize; 7] = [8000, 1600, 800, 200, 40, 10, 1];

/// Cursor into [`GROUP_SIZE_LADDER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSizeLadder {
    cursor: usize,
}

impl GroupSizeLadder {
    /// Starts at the largest rung not exceeding `max_group_size`.
    #[must_use]
    pub fn starting_at(max_group_size: usize) -> Self {
        let cursor = GROUP_SIZE_LADDER
            .iter()
            .position(|size| *size <= max_group_size)
            .unwrap_or(GROUP_SIZE_LADDER.len() - 1);

        Self { cursor }
    }

    /// Returns the current group size.
    #[must_use]
    pub fn group_size(&self) -> usize {
        GROUP_SIZE_LADDER[self.cursor]
    }

    /// Advances to the next smaller group size. Returns `false` if the ladder is exhausted.
    pub fn step_down(&mut self) -> bool {
        if self.cursor + 1 >= GROUP_SIZE_LADDER.len() {
            return false;
        }
        self.cursor += 1;
        true
    }
}

/// Capability of exposing the hash committed to the tree.
pub trait HasHash {
    /// Returns the leaf hash.
    fn hash(&self) -> Node;
}

/// Leaf record stored alongside the node hashes of a shard.
pub trait LeafData: HasHash + Clone + Send + Sync + 'static {
    /// Deserialize into `reader`
    fn read<R: Read>(reader: R) -> std::io::Result<Self>;

    /// Serialize into `writer`
    fn write<W: Write>(&self, writer: W) -> std::io::Result<()>;
}

/// Earliest leaf at which a computed root failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidMerklerootDetails {
    /// Leaf index
    pub position: u64,
    /// Block the leaf was created in
    pub block_number: u64,
}

/// Persisted state of a single shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeMetadata {
    /// Number of committed leaves
    pub scanned_height: u64,
    /// Earliest known inconsistency with the chain
    pub invalid_merkleroot_details: Option<InvalidMerklerootDetails>,
}

/// Extension points of a tree specialization.
///
/// Write ops returned by hooks are applied in the same atomic batch as the commit or rollback that triggered them.
pub trait TreeKind: Send + Sync + 'static {
    /// Leaf record type
    type Leaf: LeafData;

    /// Prefix of every key persisted for this tree kind. Changing the tree shape or hash requires a new namespace.
    const NAMESPACE: &'static str;

    /// Labels of side indexes removed by [`Merkletree::delete_all`].
    const SIDE_INDEXES: &'static [&'static str] = &[];

    /// Called when `leaves` starting at `start_index` are committed under `root`.
    fn on_new_leaf_root(
        &self,
        _paths: &TreePaths,
        _tree: u32,
        _start_index: u64,
        _leaves: &[Self::Leaf],
        _root: Node,
    ) -> Vec<WriteOp> {
        Vec::new()
    }

    /// Called when the root after `last_valid_index` is accepted, before the metadata is persisted.
    fn on_valid_root(&self, _metadata: &mut TreeMetadata, _tree: u32, _last_valid_index: u64) {}

    /// Called when the root after `last_invalid_index` is rejected, before the metadata is persisted.
    fn on_invalid_root(
        &self,
        _metadata: &mut TreeMetadata,
        _tree: u32,
        _last_invalid_index: u64,
        _last_invalid_leaf: &Self::Leaf,
    ) {
    }

    /// Called with every leaf removed by a rollback, keyed by global position.
    fn on_leaves_removed(&self, _paths: &TreePaths, _removed: &[(u64, Self::Leaf)]) -> Vec<WriteOp> {
        Vec::new()
    }
}

type NodeCache = HashMap<(u32, usize, u64), Node>;

/// Incremental merkle tree engine.
pub struct Merkletree<K, D, V>
where
    K: TreeKind,
    D: Database,
    V: MerklerootValidator,
{
    chain: Chain,
    config: MerkletreeConfig,
    kind: K,
    db: Arc<D>,
    validator: V,
    paths: TreePaths,
    metadata: RwLock<BTreeMap<u32, TreeMetadata>>,
    node_cache: RwLock<NodeCache>,
    write_queue: Mutex<WriteQueue<K::Leaf>>,
    locks: ShardLocks,
}

impl<K, D, V> std::fmt::Debug for Merkletree<K, D, V>
where
    K: TreeKind,
    D: Database,
    V: MerklerootValidator,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Merkletree")
            .field("namespace", &K::NAMESPACE)
            .field("chain", &self.chain)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<K, D, V> Merkletree<K, D, V>
where
    K: TreeKind,
    D: Database,
    V: MerklerootValidator,
{
    /// Constructs an engine over `db`, loading the metadata of every persisted shard.
    pub async fn new(
        chain: Chain,
        config: MerkletreeConfig,
        kind: K,
        db: Arc<D>,
        validator: V,
    ) -> Result<Self, MerkletreeError<D::Error>> {
        let paths = TreePaths::new(K::NAMESPACE, chain);

        let mut metadata = BTreeMap::new();
        for tree in 0u32.. {
            let Some(bytes) = db
                .get(&paths.metadata(tree))
                .await
                .map_err(MerkletreeError::StoreError)?
            else {
                break;
            };
            metadata.insert(tree, TreeMetadata::read(&bytes[..])?);
        }
        tracing::debug!(
            "Loaded metadata of {} {} trees on {chain}",
            metadata.len(),
            K::NAMESPACE
        );

        Ok(Self {
            chain,
            config,
            kind,
            db,
            validator,
            paths,
            metadata: RwLock::new(metadata),
            node_cache: RwLock::new(HashMap::new()),
            write_queue: Mutex::new(WriteQueue::default()),
            locks: ShardLocks::default(),
        })
    }

    /// Returns the chain this tree replicates.
    #[must_use]
    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &MerkletreeConfig {
        &self.config
    }

    /// Returns the specialization.
    #[must_use]
    pub fn kind(&self) -> &K {
        &self.kind
    }

    /// Returns the store.
    #[must_use]
    pub fn db(&self) -> &Arc<D> {
        &self.db
    }

    /// Returns the key paths of this tree.
    #[must_use]
    pub fn paths(&self) -> &TreePaths {
        &self.paths
    }

    pub(crate) async fn lock_tree(&self, tree: u32) -> ShardGuard {
        self.locks.lock(tree).await
    }

    pub(crate) async fn lock_trees(&self, trees: impl IntoIterator<Item = u32>) -> Vec<ShardGuard> {
        self.locks.lock_all(trees).await
    }

    /// Returns the number of committed leaves in `tree`.
    pub async fn get_tree_length(&self, tree: u32) -> u64 {
        self.metadata
            .read()
            .await
            .get(&tree)
            .map_or(0, |metadata| metadata.scanned_height)
    }

    /// Returns the metadata of `tree`, or `None` if nothing was ever persisted for it.
    pub async fn get_metadata(&self, tree: u32) -> Option<TreeMetadata> {
        self.metadata.read().await.get(&tree).cloned()
    }

    /// Returns the highest shard with at least one committed leaf.
    pub async fn latest_tree(&self) -> Option<u32> {
        self.metadata
            .read()
            .await
            .iter()
            .rev()
            .find(|(_, metadata)| metadata.scanned_height > 0)
            .map(|(tree, _)| *tree)
    }

    /// Returns the first shard with a recorded invalid root.
    pub async fn get_first_invalid_merkleroot_tree(&self) -> Option<u32> {
        self.metadata
            .read()
            .await
            .iter()
            .find(|(_, metadata)| metadata.invalid_merkleroot_details.is_some())
            .map(|(tree, _)| *tree)
    }

    /// Returns the global position after the highest committed or queued leaf.
    pub async fn next_write_position(&self) -> u64 {
        let committed = match self.latest_tree().await {
            Some(tree) => global_position(tree, self.get_tree_length(tree).await),
            None => 0,
        };
        let queued = self.write_queue.lock().await.next_position().unwrap_or(0);

        committed.max(queued)
    }

    /// Returns the hash of a node, falling back to the zero value of its level for nodes never written.
    pub async fn get_node_hash(
        &self,
        tree: u32,
        level: usize,
        index: u64,
    ) -> Result<Node, MerkletreeError<D::Error>> {
        if let Some(node) = self.node_cache.read().await.get(&(tree, level, index)) {
            return Ok(*node);
        }
        match self
            .db
            .get(&self.paths.node(tree, level, index))
            .await
            .map_err(MerkletreeError::StoreError)?
        {
            Some(bytes) => Ok(read_node(&bytes[..])?),
            None => Ok(zero(level)),
        }
    }

    /// Returns the root of `tree`.
    pub async fn get_root(&self, tree: u32) -> Result<Node, MerkletreeError<D::Error>> {
        self.get_node_hash(tree, TREE_DEPTH, 0).await
    }

    /// Returns the leaf record at `index` of `tree`.
    pub async fn get_leaf(
        &self,
        tree: u32,
        index: u64,
    ) -> Result<Option<K::Leaf>, MerkletreeError<D::Error>> {
        self.db
            .get(&self.paths.data(tree, index))
            .await
            .map_err(MerkletreeError::StoreError)?
            .map(|bytes| K::Leaf::read(&bytes[..]))
            .transpose()
            .map_err(MerkletreeError::SerializationError)
    }

    /// Replaces the record of a committed leaf. The hash of `leaf` must match the committed hash.
    pub async fn update_leaf(
        &self,
        tree: u32,
        index: u64,
        leaf: K::Leaf,
    ) -> Result<(), MerkletreeError<D::Error>> {
        let _guard = self.locks.lock(tree).await;

        if index >= self.get_tree_length(tree).await {
            return Err(ConsistencyError::LeafNotCommitted { tree, index }.into());
        }
        let committed = self.get_node_hash(tree, 0, index).await?;
        let attempted = leaf.hash();
        if committed != attempted {
            return Err(ConsistencyError::DataHashMismatch {
                tree,
                index,
                committed,
                attempted,
            }
            .into());
        }

        let mut bytes = Vec::new();
        leaf.write(&mut bytes)?;
        self.db
            .put(self.paths.data(tree, index), bytes)
            .await
            .map_err(MerkletreeError::StoreError)
    }

    /// Builds an inclusion proof for the leaf at `index` of `tree` against the live root.
    pub async fn get_merkle_proof(
        &self,
        tree: u32,
        index: u64,
    ) -> Result<MerkleProof, MerkletreeError<D::Error>> {
        let leaf = self.get_node_hash(tree, 0, index).await?;
        let root = self.get_root(tree).await?;

        build_proof(index, leaf, root, move |level, sibling_index| {
            self.get_node_hash(tree, level, sibling_index)
        })
        .await
    }

    /// Returns the leaf at `global_position`, committed or still queued.
    pub(crate) async fn get_committed_or_queued_leaf(
        &self,
        global_position: u64,
    ) -> Result<Option<K::Leaf>, MerkletreeError<D::Error>> {
        let (tree, index) = tree_and_index(global_position)
            .ok_or(MerkletreeError::PositionOutOfRange(global_position))?;
        if let Some(leaf) = self.write_queue.lock().await.get(tree, index) {
            return Ok(Some(leaf.clone()));
        }

        self.get_leaf(tree, index).await
    }

    /// Queues a batch of leaves starting at `start_index` of `tree`.
    ///
    /// Batches overflowing the shard continue at index 0 of the next shard. Batches starting before the committed
    /// length are discarded as already applied.
    pub async fn queue_leaves(&self, tree: u32, start_index: u64, leaves: Vec<K::Leaf>) {
        for (tree, start_index, leaves) in split_at_shard_boundaries(tree, start_index, leaves) {
            let length = self.get_tree_length(tree).await;
            if start_index < length {
                tracing::debug!(
                    "Ignoring {} queued leaves at tree {tree} index {start_index}, tree length is {length}",
                    leaves.len()
                );
                continue;
            }
            self.write_queue
                .lock()
                .await
                .insert(tree, start_index, leaves);
        }
    }

    /// Commits queued leaves of every shard with pending batches. Shards are processed concurrently.
    pub async fn update_trees_from_write_queue(&self) -> Result<(), MerkletreeError<D::Error>> {
        let trees = self.write_queue.lock().await.pending_trees();
        if trees.is_empty() {
            return Ok(());
        }

        futures::future::try_join_all(
            trees
                .into_iter()
                .map(|tree| self.process_write_queue_for_tree(tree)),
        )
        .await?;

        Ok(())
    }

    /// Commit loop of a single shard.
    ///
    /// Contiguous queued leaves are committed in groups. A rejected root steps the group size down the ladder and
    /// retries from the same position. When the ladder is exhausted the shard stops for this pass.
    async fn process_write_queue_for_tree(&self, tree: u32) -> Result<(), MerkletreeError<D::Error>> {
        let guard = self.locks.lock(tree).await;
        let mut ladder =
            GroupSizeLadder::starting_at(self.config.performance_level.starting_group_size());
        tracing::debug!(
            "Processing {} write queue for tree {tree}, group size {}",
            K::NAMESPACE,
            ladder.group_size()
        );

        loop {
            let length = self.get_tree_length(tree).await;
            let leaves = {
                let mut write_queue = self.write_queue.lock().await;
                write_queue.prune(tree, length);
                write_queue.gather(tree, length, ladder.group_size())
            };
            if leaves.is_empty() {
                break;
            }

            match self.insert_leaves(&guard, tree, length, &leaves).await {
                Ok(()) => {}
                Err(e) if e.is_invalid_merkleroot() => {
                    if !ladder.step_down() {
                        tracing::warn!(
                            "Leaf at tree {tree} index {length} failed validation. Stopping {} tree {tree} until it is resolved.",
                            K::NAMESPACE
                        );
                        break;
                    }
                    tracing::debug!(
                        "Retrying tree {tree} from index {length} with group size {}",
                        ladder.group_size()
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let length = self.get_tree_length(tree).await;
        self.write_queue.lock().await.prune(tree, length);
        tracing::debug!("Finished {} write queue for tree {tree}, length {length}", K::NAMESPACE);

        Ok(())
    }

    /// Inserts `leaves` starting at `start_index` of `tree`.
    ///
    /// Ancestors of the new leaves are recomputed up to the root, with untouched siblings resolved from the cache, the
    /// store or the zero value of their level. The root is validated before anything is persisted. Leaves overlapping
    /// the committed length must match the committed hashes.
    pub(crate) async fn insert_leaves(
        &self,
        guard: &ShardGuard,
        tree: u32,
        start_index: u64,
        leaves: &[K::Leaf],
    ) -> Result<(), MerkletreeError<D::Error>> {
        debug_assert_eq!(guard.tree(), tree);

        let length = self.get_tree_length(tree).await;
        if start_index > length {
            return Err(ConsistencyError::WriteGap {
                tree,
                length,
                start_index,
            }
            .into());
        }
        if start_index + leaves.len() as u64 > TREE_MAX_ITEMS {
            return Err(MerkletreeError::TreeFull { tree });
        }

        let overlap = ((length - start_index) as usize).min(leaves.len());
        for (offset, leaf) in leaves[..overlap].iter().enumerate() {
            let index = start_index + offset as u64;
            let committed = self.get_node_hash(tree, 0, index).await?;
            let attempted = leaf.hash();
            if committed != attempted {
                return Err(ConsistencyError::LeafMismatch {
                    tree,
                    index,
                    committed,
                    attempted,
                }
                .into());
            }
        }
        let leaves = &leaves[overlap..];
        if leaves.is_empty() {
            return Ok(());
        }
        let start_index = length;
        let last_index = start_index + leaves.len() as u64 - 1;

        let mut updates: HashMap<(usize, u64), Node> = leaves
            .iter()
            .enumerate()
            .map(|(offset, leaf)| ((0, start_index + offset as u64), leaf.hash()))
            .collect();
        let mut level_start = start_index;
        let mut level_end = last_index;
        for level in 0..TREE_DEPTH {
            for parent_index in (level_start >> 1)..=(level_end >> 1) {
                let left = self.resolve_node(&updates, tree, level, parent_index * 2).await?;
                let right = self
                    .resolve_node(&updates, tree, level, parent_index * 2 + 1)
                    .await?;
                updates.insert((level + 1, parent_index), hash_left_right(&left, &right));
            }
            level_start >>= 1;
            level_end >>= 1;
        }
        let root = updates[&(TREE_DEPTH, 0)];

        let mut metadata = self.get_metadata(tree).await.unwrap_or_default();
        if !self
            .validator
            .validate(self.chain, tree, last_index, root)
            .await?
        {
            tracing::warn!(
                "Invalid merkleroot {root} for {} tree {tree} at index {last_index}",
                K::NAMESPACE
            );
            let last_leaf = leaves.last().expect("leaves is not empty");
            self.kind
                .on_invalid_root(&mut metadata, tree, last_index, last_leaf);
            self.write_metadata(tree, metadata).await?;

            return Err(MerkletreeError::InvalidMerkleroot {
                tree,
                last_index,
                root,
            });
        }

        let mut ops = Vec::with_capacity(updates.len() + leaves.len() + 1);
        for ((level, index), node) in &updates {
            let mut bytes = Vec::with_capacity(32);
            write_node(&mut bytes, node)?;
            ops.push(WriteOp::Put(self.paths.node(tree, *level, *index), bytes));
        }
        for (offset, leaf) in leaves.iter().enumerate() {
            let mut bytes = Vec::new();
            leaf.write(&mut bytes)?;
            ops.push(WriteOp::Put(
                self.paths.data(tree, start_index + offset as u64),
                bytes,
            ));
        }
        ops.extend(
            self.kind
                .on_new_leaf_root(&self.paths, tree, start_index, leaves, root),
        );
        metadata.scanned_height = last_index + 1;
        self.kind.on_valid_root(&mut metadata, tree, last_index);
        let mut bytes = Vec::new();
        metadata.write(&mut bytes)?;
        ops.push(WriteOp::Put(self.paths.metadata(tree), bytes));

        self.db
            .batch(ops)
            .await
            .map_err(MerkletreeError::StoreError)?;

        self.node_cache.write().await.extend(
            updates
                .into_iter()
                .map(|((level, index), node)| ((tree, level, index), node)),
        );
        self.metadata.write().await.insert(tree, metadata);

        Ok(())
    }

    async fn resolve_node(
        &self,
        updates: &HashMap<(usize, u64), Node>,
        tree: u32,
        level: usize,
        index: u64,
    ) -> Result<Node, MerkletreeError<D::Error>> {
        match updates.get(&(level, index)) {
            Some(node) => Ok(*node),
            None => self.get_node_hash(tree, level, index).await,
        }
    }

    async fn write_metadata(
        &self,
        tree: u32,
        metadata: TreeMetadata,
    ) -> Result<(), MerkletreeError<D::Error>> {
        let mut bytes = Vec::new();
        metadata.write(&mut bytes)?;
        self.db
            .put(self.paths.metadata(tree), bytes)
            .await
            .map_err(MerkletreeError::StoreError)?;
        self.metadata.write().await.insert(tree, metadata);

        Ok(())
    }

    /// Reads the leaf records of `tree` from `start_index` on, in index order.
    async fn read_leaves_from(
        &self,
        tree: u32,
        start_index: u64,
    ) -> Result<Vec<(u64, K::Leaf)>, MerkletreeError<D::Error>> {
        let prefix = self.paths.data_prefix(tree);
        let end = prefix.join([0xff; crate::store::SEGMENT_LENGTH]);
        let mut stream = pin!(self.db.stream_range(prefix.join_number(start_index), end));

        let mut leaves = Vec::new();
        while let Some((path, bytes)) = stream
            .try_next()
            .await
            .map_err(MerkletreeError::StoreError)?
        {
            let index = leaf_index(&path)?;
            leaves.push((index, K::Leaf::read(&bytes[..])?));
        }

        Ok(leaves)
    }

    /// Recomputes every node of `tree` from its leaf records, using zero values for any gap.
    pub async fn rebuild_and_write_tree(&self, tree: u32) -> Result<(), MerkletreeError<D::Error>> {
        let guard = self.locks.lock(tree).await;
        self.rebuild_and_write_tree_locked(&guard, tree).await
    }

    async fn rebuild_and_write_tree_locked(
        &self,
        guard: &ShardGuard,
        tree: u32,
    ) -> Result<(), MerkletreeError<D::Error>> {
        debug_assert_eq!(guard.tree(), tree);

        let leaves = self.read_leaves_from(tree, 0).await?;
        let length = leaves.last().map_or(0, |(index, _)| index + 1);
        tracing::info!(
            "Rebuilding {} tree {tree} from {} leaves",
            K::NAMESPACE,
            leaves.len()
        );

        let mut ops = Vec::new();
        let mut level_nodes: BTreeMap<u64, Node> = leaves
            .iter()
            .map(|(index, leaf)| (*index, leaf.hash()))
            .collect();
        for level in 0..=TREE_DEPTH {
            for (index, node) in &level_nodes {
                let mut bytes = Vec::with_capacity(32);
                write_node(&mut bytes, node)?;
                ops.push(WriteOp::Put(self.paths.node(tree, level, *index), bytes));
            }
            if level == TREE_DEPTH {
                break;
            }
            let mut parents = BTreeMap::new();
            for index in level_nodes.keys() {
                let parent_index = index >> 1;
                if parents.contains_key(&parent_index) {
                    continue;
                }
                let left = level_nodes
                    .get(&(parent_index * 2))
                    .copied()
                    .unwrap_or_else(|| zero(level));
                let right = level_nodes
                    .get(&(parent_index * 2 + 1))
                    .copied()
                    .unwrap_or_else(|| zero(level));
                parents.insert(parent_index, hash_left_right(&left, &right));
            }
            level_nodes = parents;
        }

        let mut metadata = self.get_metadata(tree).await.unwrap_or_default();
        metadata.scanned_height = length;
        let mut bytes = Vec::new();
        metadata.write(&mut bytes)?;
        ops.push(WriteOp::Put(self.paths.metadata(tree), bytes));

        for level in 0..=TREE_DEPTH {
            self.db
                .clear_namespace(&self.paths.level(tree, level))
                .await
                .map_err(MerkletreeError::StoreError)?;
        }
        self.node_cache
            .write()
            .await
            .retain(|(cached_tree, _, _), _| *cached_tree != tree);
        self.db
            .batch(ops)
            .await
            .map_err(MerkletreeError::StoreError)?;
        self.metadata.write().await.insert(tree, metadata);

        Ok(())
    }

    /// Removes every leaf strictly after `global_position` and rebuilds the truncated shard.
    ///
    /// Leaf records, node hashes, queued batches and metadata of later positions are removed from every shard. Side
    /// indexes of the removed leaves are pruned through [`TreeKind::on_leaves_removed`].
    pub async fn clear_leaves_after_position(
        &self,
        global_position: u64,
    ) -> Result<(), MerkletreeError<D::Error>> {
        let (tree, index) = tree_and_index(global_position)
            .ok_or(MerkletreeError::PositionOutOfRange(global_position))?;
        let last_tree = self
            .metadata
            .read()
            .await
            .keys()
            .next_back()
            .copied()
            .unwrap_or(tree)
            .max(tree);
        let guards = self.locks.lock_all(tree..=last_tree).await;
        tracing::info!(
            "Clearing {} leaves after tree {tree} index {index}",
            K::NAMESPACE
        );

        let mut removed = Vec::new();
        for (removed_tree, start_index) in
            std::iter::once((tree, index + 1)).chain((tree + 1..=last_tree).map(|t| (t, 0)))
        {
            removed.extend(
                self.read_leaves_from(removed_tree, start_index)
                    .await?
                    .into_iter()
                    .map(|(leaf_index, leaf)| {
                        (crate::global_position(removed_tree, leaf_index), leaf)
                    }),
            );
        }

        let mut ops = self.kind.on_leaves_removed(&self.paths, &removed);
        for (removed_tree, removed_index) in removed
            .iter()
            .filter_map(|(position, _)| tree_and_index(*position))
            .filter(|(removed_tree, _)| *removed_tree == tree)
        {
            ops.push(WriteOp::Del(self.paths.data(removed_tree, removed_index)));
        }
        let mut metadata = self.get_metadata(tree).await.unwrap_or_default();
        if metadata
            .invalid_merkleroot_details
            .is_some_and(|details| details.position > index)
        {
            metadata.invalid_merkleroot_details = None;
        }
        let mut bytes = Vec::new();
        metadata.write(&mut bytes)?;
        ops.push(WriteOp::Put(self.paths.metadata(tree), bytes));
        self.db
            .batch(ops)
            .await
            .map_err(MerkletreeError::StoreError)?;

        for later_tree in tree + 1..=last_tree {
            self.db
                .clear_namespace(&self.paths.tree(later_tree))
                .await
                .map_err(MerkletreeError::StoreError)?;
        }
        {
            let mut cached_metadata = self.metadata.write().await;
            cached_metadata.retain(|cached_tree, _| *cached_tree <= tree);
            cached_metadata.insert(tree, metadata);
        }
        self.node_cache
            .write()
            .await
            .retain(|(cached_tree, _, _), _| *cached_tree < tree);
        self.write_queue.lock().await.truncate_after(tree, index);

        let (guard, _later_guards) = guards
            .split_first()
            .expect("guards include the truncated tree");
        self.rebuild_and_write_tree_locked(guard, tree).await
    }

    /// Removes every shard, queued batch and side index of this tree kind.
    pub async fn delete_all(&self) -> Result<(), MerkletreeError<D::Error>> {
        let trees = self
            .metadata
            .read()
            .await
            .keys()
            .copied()
            .collect::<Vec<_>>();
        let _guards = self.locks.lock_all(trees.iter().copied()).await;
        tracing::info!("Deleting all {} trees on {}", K::NAMESPACE, self.chain);

        for tree in &trees {
            self.db
                .clear_namespace(&self.paths.tree(*tree))
                .await
                .map_err(MerkletreeError::StoreError)?;
        }
        for label in K::SIDE_INDEXES {
            self.db
                .clear_namespace(&self.paths.side_index(label))
                .await
                .map_err(MerkletreeError::StoreError)?;
        }
        self.metadata.write().await.clear();
        self.node_cache.write().await.clear();
        self.write_queue.lock().await.clear();

        Ok(())
    }
}

fn leaf_index<E>(path: &KeyPath) -> Result<u64, MerkletreeError<E>>
where
    E: std::fmt::Debug + std::fmt::Display,
{
    path.last_number().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "leaf record key does not end with an index",
        )
        .into()
    })
}
