//! Commitment tree.
//!
//! Leaves are the commitments created by shield and transact events. Alongside the tree the commitment tree stores
//! spent nullifiers and unshield events, and records the earliest leaf whose root failed validation.

use std::pin::pin;

use futures::TryStreamExt;

use crate::error::MerkletreeError;
use crate::hash::{Node, keccak_to_field, poseidon};
use crate::merkletree::{HasHash, InvalidMerklerootDetails, Merkletree, TreeKind, TreeMetadata};
use crate::store::{Database, KeyPath, TreePaths, WriteOp};
use crate::validator::MerklerootValidator;

const NULLIFIERS: &str = "nullifiers";
const UNSHIELDS: &str = "unshields";

/// Token standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    /// ERC-20 fungible token
    Erc20,
    /// ERC-721 non-fungible token
    Erc721,
    /// ERC-1155 multi token
    Erc1155,
}

impl TokenType {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Erc20 => 0,
            Self::Erc721 => 1,
            Self::Erc1155 => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> std::io::Result<Self> {
        match value {
            0 => Ok(Self::Erc20),
            1 => Ok(Self::Erc721),
            2 => Ok(Self::Erc1155),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid token type",
            )),
        }
    }
}

/// Token held by a commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenData {
    /// Token standard
    pub token_type: TokenType,
    /// Token contract address
    pub token_address: [u8; 20],
    /// Token id within the contract. Zero for ERC-20 tokens.
    pub token_sub_id: Node,
}

impl TokenData {
    /// Constructs an ERC-20 token.
    #[must_use]
    pub fn erc20(token_address: [u8; 20]) -> Self {
        Self {
            token_type: TokenType::Erc20,
            token_address,
            token_sub_id: Node::default(),
        }
    }

    /// Returns the field element identifying the token in commitment hashes.
    ///
    /// ERC-20 tokens hash to their zero padded address. Other tokens hash to keccak256 of the abi encoded token type,
    /// address and sub id, reduced into the scalar field.
    #[must_use]
    pub fn token_hash(&self) -> Node {
        match self.token_type {
            TokenType::Erc20 => {
                let mut bytes = [0u8; 32];
                bytes[12..].copy_from_slice(&self.token_address);
                Node::from_bytes(bytes)
            }
            TokenType::Erc721 | TokenType::Erc1155 => {
                let mut encoded = [0u8; 96];
                encoded[31] = self.token_type.to_u8();
                encoded[44..64].copy_from_slice(&self.token_address);
                encoded[64..].copy_from_slice(self.token_sub_id.as_bytes());
                Node::from_field(keccak_to_field(&encoded))
            }
        }
    }
}

/// Opening of a commitment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentPreimage {
    /// Note public key
    pub npk: Node,
    /// Token
    pub token: TokenData,
    /// Value
    pub value: u128,
}

impl CommitmentPreimage {
    /// Returns `poseidon(npk, token_hash, value)`.
    #[must_use]
    pub fn commitment_hash(&self) -> Node {
        let mut value = [0u8; 32];
        value[16..].copy_from_slice(&self.value.to_be_bytes());

        poseidon(&[self.npk, self.token.token_hash(), Node::from_bytes(value)])
    }
}

/// Event a commitment was created by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitmentKind {
    /// Deposit into the pool with a public preimage.
    Shield {
        /// Commitment opening
        preimage: CommitmentPreimage,
        /// Encrypted note randomness
        encrypted_bundle: Vec<u8>,
        /// Ephemeral key of the shielding party
        shield_key: Node,
    },
    /// Private transfer output.
    Transact {
        /// Encrypted note
        ciphertext: Vec<u8>,
    },
}

/// Leaf record of the commitment tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commitment {
    /// Commitment hash
    pub hash: Node,
    /// Transaction the commitment was created in
    pub txid: Node,
    /// Block the commitment was created in
    pub block_number: u64,
    /// Block timestamp, if known
    pub timestamp: Option<u64>,
    /// Creating event
    pub kind: CommitmentKind,
}

impl Commitment {
    /// Constructs a shield commitment. The hash is computed from the preimage.
    #[must_use]
    pub fn shield(
        txid: Node,
        block_number: u64,
        timestamp: Option<u64>,
        preimage: CommitmentPreimage,
        encrypted_bundle: Vec<u8>,
        shield_key: Node,
    ) -> Self {
        Self {
            hash: preimage.commitment_hash(),
            txid,
            block_number,
            timestamp,
            kind: CommitmentKind::Shield {
                preimage,
                encrypted_bundle,
                shield_key,
            },
        }
    }

    /// Constructs a transact commitment.
    #[must_use]
    pub fn transact(
        hash: Node,
        txid: Node,
        block_number: u64,
        timestamp: Option<u64>,
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            hash,
            txid,
            block_number,
            timestamp,
            kind: CommitmentKind::Transact { ciphertext },
        }
    }
}

impl HasHash for Commitment {
    fn hash(&self) -> Node {
        self.hash
    }
}

/// Nullifier spent in a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nullifier {
    /// Nullifier
    pub nullifier: Node,
    /// Tree of the spent commitment
    pub tree_number: u32,
    /// Spending transaction
    pub txid: Node,
    /// Block of the spending transaction
    pub block_number: u64,
}

/// Withdrawal from the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnshieldEvent {
    /// Transaction
    pub txid: Node,
    /// Log index of the event in the transaction
    pub event_log_index: u64,
    /// Recipient
    pub to_address: [u8; 20],
    /// Token
    pub token: TokenData,
    /// Amount received
    pub amount: u128,
    /// Protocol fee
    pub fee: u128,
    /// Block of the transaction
    pub block_number: u64,
    /// Block timestamp, if known
    pub timestamp: Option<u64>,
}

/// Commitment tree specialization.
#[derive(Debug, Default, Clone, Copy)]
pub struct UtxoTree;

impl TreeKind for UtxoTree {
    type Leaf = Commitment;

    const NAMESPACE: &'static str = "utxo-merkletree-v1";

    const SIDE_INDEXES: &'static [&'static str] = &[NULLIFIERS, UNSHIELDS];

    fn on_valid_root(&self, metadata: &mut TreeMetadata, tree: u32, last_valid_index: u64) {
        if metadata
            .invalid_merkleroot_details
            .is_some_and(|details| details.position <= last_valid_index)
        {
            tracing::info!("Invalid merkleroot of tree {tree} superseded at index {last_valid_index}");
            metadata.invalid_merkleroot_details = None;
        }
    }

    fn on_invalid_root(
        &self,
        metadata: &mut TreeMetadata,
        _tree: u32,
        last_invalid_index: u64,
        last_invalid_leaf: &Commitment,
    ) {
        if metadata
            .invalid_merkleroot_details
            .is_some_and(|details| details.position <= last_invalid_index)
        {
            return;
        }
        metadata.invalid_merkleroot_details = Some(InvalidMerklerootDetails {
            position: last_invalid_index,
            block_number: last_invalid_leaf.block_number,
        });
    }
}

/// Commitment tree engine.
pub type UtxoMerkletree<D, V> = Merkletree<UtxoTree, D, V>;

fn nullifier_path(paths: &TreePaths, tree: u32, nullifier: &Node) -> KeyPath {
    paths
        .side_index(NULLIFIERS)
        .join_number(u64::from(tree))
        .join(nullifier.to_bytes())
}

fn unshield_path(paths: &TreePaths, txid: &Node, event_log_index: u64) -> KeyPath {
    paths
        .side_index(UNSHIELDS)
        .join(txid.to_bytes())
        .join_number(event_log_index)
}

impl<D, V> Merkletree<UtxoTree, D, V>
where
    D: Database,
    V: MerklerootValidator,
{
    /// Stores spent nullifiers. A nullifier already stored is never overwritten.
    ///
    /// Holds the shard locks of every `tree_number` involved until the batch is written.
    pub async fn nullify(&self, nullifiers: &[Nullifier]) -> Result<(), MerkletreeError<D::Error>> {
        let _guards = self
            .lock_trees(nullifiers.iter().map(|nullifier| nullifier.tree_number))
            .await;
        let mut ops = Vec::with_capacity(nullifiers.len());
        for nullifier in nullifiers {
            let path = nullifier_path(self.paths(), nullifier.tree_number, &nullifier.nullifier);
            let stored = ops.iter().any(|op| matches!(op, WriteOp::Put(p, _) if *p == path))
                || self
                    .db()
                    .get(&path)
                    .await
                    .map_err(MerkletreeError::StoreError)?
                    .is_some();
            if stored {
                tracing::debug!(
                    "Nullifier {} of tree {} already stored",
                    nullifier.nullifier,
                    nullifier.tree_number
                );
                continue;
            }
            let mut bytes = Vec::new();
            nullifier.write(&mut bytes)?;
            ops.push(WriteOp::Put(path, bytes));
        }

        self.db()
            .batch(ops)
            .await
            .map_err(MerkletreeError::StoreError)
    }

    /// Returns the transaction that spent `nullifier`.
    ///
    /// Trees are searched newest first, starting one past the latest tree since nullifiers may be stored before the
    /// tree of the commitment they spend.
    pub async fn get_nullifier_txid(
        &self,
        nullifier: &Node,
    ) -> Result<Option<Node>, MerkletreeError<D::Error>> {
        let first_tree = self.latest_tree().await.map_or(0, |tree| tree + 1);
        for tree in (0..=first_tree).rev() {
            if let Some(bytes) = self
                .db()
                .get(&nullifier_path(self.paths(), tree, nullifier))
                .await
                .map_err(MerkletreeError::StoreError)?
            {
                return Ok(Some(Nullifier::read(&bytes[..])?.txid));
            }
        }

        Ok(None)
    }

    /// Returns every nullifier stored for `tree`.
    pub async fn get_nullifiers_for_tree(
        &self,
        tree: u32,
    ) -> Result<Vec<Nullifier>, MerkletreeError<D::Error>> {
        let prefix = self.paths().side_index(NULLIFIERS).join_number(u64::from(tree));
        let mut stream = pin!(self.db().stream_namespace(&prefix));

        let mut nullifiers = Vec::new();
        while let Some((_, bytes)) = stream
            .try_next()
            .await
            .map_err(MerkletreeError::StoreError)?
        {
            nullifiers.push(Nullifier::read(&bytes[..])?);
        }

        Ok(nullifiers)
    }

    /// Stores unshield events keyed by transaction and log index.
    pub async fn add_unshield_events(
        &self,
        events: &[UnshieldEvent],
    ) -> Result<(), MerkletreeError<D::Error>> {
        let mut ops = Vec::with_capacity(events.len());
        for event in events {
            let mut bytes = Vec::new();
            event.write(&mut bytes)?;
            ops.push(WriteOp::Put(
                unshield_path(self.paths(), &event.txid, event.event_log_index),
                bytes,
            ));
        }

        self.db()
            .batch(ops)
            .await
            .map_err(MerkletreeError::StoreError)
    }

    /// Returns the unshield events of `txid` in log index order.
    pub async fn get_unshield_events(
        &self,
        txid: &Node,
    ) -> Result<Vec<UnshieldEvent>, MerkletreeError<D::Error>> {
        self.read_unshield_events(self.paths().side_index(UNSHIELDS).join(txid.to_bytes()))
            .await
    }

    /// Returns every stored unshield event.
    pub async fn get_all_unshield_events(
        &self,
    ) -> Result<Vec<UnshieldEvent>, MerkletreeError<D::Error>> {
        self.read_unshield_events(self.paths().side_index(UNSHIELDS))
            .await
    }

    async fn read_unshield_events(
        &self,
        prefix: KeyPath,
    ) -> Result<Vec<UnshieldEvent>, MerkletreeError<D::Error>> {
        let mut stream = pin!(self.db().stream_namespace(&prefix));

        let mut events = Vec::new();
        while let Some((_, bytes)) = stream
            .try_next()
            .await
            .map_err(MerkletreeError::StoreError)?
        {
            events.push(UnshieldEvent::read(&bytes[..])?);
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erc20_token_hash_is_padded_address() {
        let token = TokenData::erc20([0xab; 20]);
        let hash = token.token_hash();
        assert!(hash.as_bytes()[..12].iter().all(|byte| *byte == 0));
        assert_eq!(&hash.as_bytes()[12..], &[0xab; 20]);
    }

    #[test]
    fn nft_token_hash_depends_on_sub_id() {
        let mut token = TokenData {
            token_type: TokenType::Erc721,
            token_address: [1; 20],
            token_sub_id: Node::from_u64(1),
        };
        let first = token.token_hash();
        token.token_sub_id = Node::from_u64(2);
        assert_ne!(first, token.token_hash());
    }

    #[test]
    fn invalid_root_keeps_the_earliest_position() {
        let leaf = Commitment::transact(Node::from_u64(1), Node::from_u64(2), 10, None, Vec::new());
        let mut metadata = TreeMetadata::default();

        UtxoTree.on_invalid_root(&mut metadata, 0, 20, &leaf);
        UtxoTree.on_invalid_root(&mut metadata, 0, 30, &leaf);
        assert_eq!(metadata.invalid_merkleroot_details.unwrap().position, 20);
        UtxoTree.on_invalid_root(&mut metadata, 0, 5, &leaf);
        assert_eq!(metadata.invalid_merkleroot_details.unwrap().position, 5);

        UtxoTree.on_valid_root(&mut metadata, 0, 4);
        assert!(metadata.invalid_merkleroot_details.is_some());
        UtxoTree.on_valid_root(&mut metadata, 0, 5);
        assert!(metadata.invalid_merkleroot_details.is_none());
    }
}
