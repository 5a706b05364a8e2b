//! Per-shard update locks.
//!
//! A guard is a token proving its holder has exclusive write access to a shard. Operations that nest, such as a
//! rollback followed by a rebuild, pass the guard down instead of acquiring the lock again.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub(crate) struct ShardLocks {
    locks: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl ShardLocks {
    /// Waits for exclusive access to `tree`.
    pub(crate) async fn lock(&self, tree: u32) -> ShardGuard {
        let lock = self
            .locks
            .lock()
            .await
            .entry(tree)
            .or_default()
            .clone();

        ShardGuard {
            tree,
            _guard: lock.lock_owned().await,
        }
    }

    /// Waits for exclusive access to every shard in `trees`, acquired in ascending order.
    pub(crate) async fn lock_all(&self, trees: impl IntoIterator<Item = u32>) -> Vec<ShardGuard> {
        let mut trees = trees.into_iter().collect::<Vec<_>>();
        trees.sort_unstable();
        trees.dedup();
        let mut guards = Vec::with_capacity(trees.len());
        for tree in trees {
            guards.push(self.lock(tree).await);
        }
        guards
    }
}

/// Exclusive access to a single shard, released on drop.
#[derive(Debug)]
pub(crate) struct ShardGuard {
    tree: u32,
    _guard: OwnedMutexGuard<()>,
}

impl ShardGuard {
    pub(crate) fn tree(&self) -> u32 {
        self.tree
    }
}
