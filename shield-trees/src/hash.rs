//! Node hashing and the zero value chain.

use std::sync::LazyLock;

use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField};
use light_poseidon::{Poseidon, PoseidonHasher};
use sha3::{Digest, Keccak256};

use crate::TREE_DEPTH;

/// Seed of the protocol zero value. `zero(0)` is keccak256 of this seed reduced into the scalar field.
const ZERO_VALUE_SEED: &[u8] = b"Railgun";

static ZERO_VALUES: LazyLock<[Node; TREE_DEPTH + 1]> = LazyLock::new(|| {
    let mut zeros = [Node::from_field(keccak_to_field(ZERO_VALUE_SEED)); TREE_DEPTH + 1];
    for level in 1..=TREE_DEPTH {
        zeros[level] = hash_left_right(&zeros[level - 1], &zeros[level - 1]);
    }
    zeros
});

/// A 32 byte merkle tree node, big-endian encoding of a BN254 scalar field element.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Node([u8; 32]);

impl Node {
    /// Constructs a node from its big-endian byte representation.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Constructs a node holding the big-endian encoding of `value`.
    ///
    /// ```
    /// use shield_trees::Node;
    ///
    /// assert_eq!(Node::from_u64(5).to_string(), format!("{:064x}", 5));
    /// ```
    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    /// Parses a hex string, with or without `0x` prefix. Shorter strings are left padded with zeros.
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let stripped = hex_str.trim_start_matches("0x");
        if stripped.len() > 64 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let padded = format!("{stripped:0>64}");
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(padded, &mut bytes)?;

        Ok(Self(bytes))
    }

    /// Returns the big-endian byte representation.
    #[must_use]
    pub const fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Returns a reference to the underlying bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub(crate) fn to_field(self) -> Fr {
        Fr::from_be_bytes_mod_order(&self.0)
    }

    pub(crate) fn from_field(field: Fr) -> Self {
        let bytes = field.into_bigint().to_bytes_be();
        let mut node = [0u8; 32];
        node[32 - bytes.len()..].copy_from_slice(&bytes);
        Self(node)
    }
}

impl From<[u8; 32]> for Node {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({self})")
    }
}

/// Poseidon hash of `inputs` with circom parameters.
///
/// Inputs are reduced into the BN254 scalar field before hashing.
///
/// Panics if `inputs` is empty or has more than 12 elements.
#[must_use]
pub fn poseidon(inputs: &[Node]) -> Node {
    let mut hasher = Poseidon::<Fr>::new_circom(inputs.len())
        .expect("poseidon supports between 1 and 12 inputs");
    let fields: Vec<Fr> = inputs.iter().map(|node| node.to_field()).collect();
    let output = hasher
        .hash(&fields)
        .expect("input count matches the hasher width");

    Node::from_field(output)
}

/// Hashes two sibling nodes into their parent. The order of the operands matters.
#[must_use]
pub fn hash_left_right(left: &Node, right: &Node) -> Node {
    poseidon(&[*left, *right])
}

/// Returns the hash of an empty subtree at `level`.
///
/// Panics if `level` is greater than [`crate::TREE_DEPTH`].
#[must_use]
pub fn zero(level: usize) -> Node {
    ZERO_VALUES[level]
}

/// Returns the root of a shard with no committed leaves.
#[must_use]
pub fn empty_root() -> Node {
    zero(TREE_DEPTH)
}

/// keccak256 of `data` reduced into the scalar field.
pub(crate) fn keccak_to_field(data: &[u8]) -> Fr {
    Fr::from_be_bytes_mod_order(&Keccak256::digest(data))
}
