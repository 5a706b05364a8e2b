//! Merkleroot validation.
//!
//! Every computed root is confirmed by an external authority before the leaves it covers are committed.

use std::future::Future;

use crate::config::Chain;
use crate::error::ValidatorError;
use crate::hash::Node;

/// Trait for confirming that a locally computed root matches the root anchored on chain.
///
/// Must be safe to call repeatedly with the same arguments.
pub trait MerklerootValidator: Send + Sync {
    /// Returns `true` if `root` is the root of shard `tree` after the leaf at `last_index` was inserted.
    fn validate(
        &self,
        chain: Chain,
        tree: u32,
        last_index: u64,
        root: Node,
    ) -> impl Future<Output = Result<bool, ValidatorError>> + Send;
}

impl<F> MerklerootValidator for F
where
    F: Fn(u32, u64, &Node) -> bool + Send + Sync,
{
    async fn validate(
        &self,
        _chain: Chain,
        tree: u32,
        last_index: u64,
        root: Node,
    ) -> Result<bool, ValidatorError> {
        Ok(self(tree, last_index, &root))
    }
}

/// Validator accepting every root. For trees whose roots are checked elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl MerklerootValidator for AcceptAll {
    async fn validate(
        &self,
        _chain: Chain,
        _tree: u32,
        _last_index: u64,
        _root: Node,
    ) -> Result<bool, ValidatorError> {
        Ok(true)
    }
}
