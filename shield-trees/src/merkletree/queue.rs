//! Per-shard write queue.

use std::collections::BTreeMap;

use crate::{TREE_MAX_ITEMS, global_position};

/// Queued leaf batches keyed by shard and starting index.
#[derive(Debug)]
pub(crate) struct WriteQueue<L> {
    entries: BTreeMap<u32, BTreeMap<u64, Vec<L>>>,
}

impl<L> Default for WriteQueue<L> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

/// Splits a batch at shard boundaries so each part fits in a single shard.
pub(crate) fn split_at_shard_boundaries<L>(
    tree: u32,
    start_index: u64,
    mut leaves: Vec<L>,
) -> Vec<(u32, u64, Vec<L>)> {
    let mut parts = Vec::new();
    let mut tree = tree;
    let mut start_index = start_index;
    while !leaves.is_empty() {
        let room = TREE_MAX_ITEMS.saturating_sub(start_index) as usize;
        if leaves.len() <= room {
            parts.push((tree, start_index, leaves));
            break;
        }
        let overflow = leaves.split_off(room);
        if room > 0 {
            parts.push((tree, start_index, leaves));
        }
        leaves = overflow;
        tree += 1;
        start_index = 0;
    }
    parts
}

impl<L: Clone> WriteQueue<L> {
    /// Queues a batch. A batch already queued at the same position is replaced.
    pub(crate) fn insert(&mut self, tree: u32, start_index: u64, leaves: Vec<L>) {
        if leaves.is_empty() {
            return;
        }
        self.entries
            .entry(tree)
            .or_default()
            .insert(start_index, leaves);
    }

    /// Returns the shards with queued batches in ascending order.
    pub(crate) fn pending_trees(&self) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|(_, batches)| !batches.is_empty())
            .map(|(tree, _)| *tree)
            .collect()
    }

    /// Collects up to `max_leaves` contiguous leaves starting exactly at `start_index`.
    ///
    /// A batch that does not fit is split, the leaves after the split stay queued.
    pub(crate) fn gather(&self, tree: u32, start_index: u64, max_leaves: usize) -> Vec<L> {
        let mut leaves = Vec::new();
        let Some(batches) = self.entries.get(&tree) else {
            return leaves;
        };
        let mut position = start_index;
        while leaves.len() < max_leaves {
            let Some(batch) = batches.get(&position) else {
                break;
            };
            let take = batch.len().min(max_leaves - leaves.len());
            leaves.extend_from_slice(&batch[..take]);
            position += take as u64;
            if take < batch.len() {
                break;
            }
        }
        leaves
    }

    /// Drops every leaf before `length`. A batch straddling `length` keeps its tail, re-keyed at `length`.
    pub(crate) fn prune(&mut self, tree: u32, length: u64) {
        let Some(batches) = self.entries.get_mut(&tree) else {
            return;
        };
        let stale = batches.range(..length).map(|(start, _)| *start).collect::<Vec<_>>();
        for start in stale {
            let Some(mut batch) = batches.remove(&start) else {
                continue;
            };
            let applied = (length - start) as usize;
            if applied < batch.len() {
                let tail = batch.split_off(applied);
                batches.entry(length).or_insert(tail);
            }
        }
        if batches.is_empty() {
            self.entries.remove(&tree);
        }
    }

    /// Removes every queued leaf after `index` of `tree` and every batch of later shards.
    pub(crate) fn truncate_after(&mut self, tree: u32, index: u64) {
        self.entries.retain(|queued_tree, _| *queued_tree <= tree);
        let Some(batches) = self.entries.get_mut(&tree) else {
            return;
        };
        batches.retain(|start, _| *start <= index);
        for (start, batch) in batches.iter_mut() {
            batch.truncate((index - start + 1) as usize);
        }
        if batches.is_empty() {
            self.entries.remove(&tree);
        }
    }

    /// Returns the queued leaf at `index` of `tree`.
    pub(crate) fn get(&self, tree: u32, index: u64) -> Option<&L> {
        let (start, batch) = self.entries.get(&tree)?.range(..=index).next_back()?;
        batch.get((index - start) as usize)
    }

    /// Returns the global position after the last queued leaf.
    pub(crate) fn next_position(&self) -> Option<u64> {
        self.entries
            .iter()
            .flat_map(|(tree, batches)| {
                batches
                    .iter()
                    .map(|(start, batch)| global_position(*tree, start + batch.len() as u64))
            })
            .max()
    }

    /// Removes every queued batch.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_walks_contiguous_batches_only() {
        let mut queue = WriteQueue::default();
        queue.insert(0, 0, vec![0, 1]);
        queue.insert(0, 2, vec![2, 3, 4]);
        queue.insert(0, 7, vec![7]);

        assert_eq!(queue.gather(0, 0, 100), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.gather(0, 0, 3), vec![0, 1, 2]);
        assert!(queue.gather(0, 1, 100).is_empty());
        assert!(queue.gather(1, 0, 100).is_empty());
    }

    #[test]
    fn get_finds_leaves_inside_batches() {
        let mut queue = WriteQueue::default();
        queue.insert(0, 2, vec![2, 3, 4]);
        queue.insert(1, 0, vec![10]);

        assert_eq!(queue.get(0, 3), Some(&3));
        assert_eq!(queue.get(0, 5), None);
        assert_eq!(queue.get(0, 1), None);
        assert_eq!(queue.get(1, 0), Some(&10));
    }

    #[test]
    fn prune_keeps_the_tail_of_a_split_batch() {
        let mut queue = WriteQueue::default();
        queue.insert(0, 0, vec![0, 1, 2, 3]);
        queue.insert(0, 4, vec![4]);

        queue.prune(0, 3);
        assert_eq!(queue.gather(0, 3, 100), vec![3, 4]);

        queue.prune(0, 5);
        assert!(queue.pending_trees().is_empty());
    }

    #[test]
    fn overflowing_batches_continue_in_the_next_tree() {
        let parts = split_at_shard_boundaries(2, TREE_MAX_ITEMS - 1, vec![1, 2, 3]);
        assert_eq!(
            parts,
            vec![(2, TREE_MAX_ITEMS - 1, vec![1]), (3, 0, vec![2, 3])]
        );
    }

    #[test]
    fn truncate_after_drops_later_positions() {
        let mut queue = WriteQueue::default();
        queue.insert(0, 3, vec![3, 4, 5]);
        queue.insert(0, 8, vec![8]);
        queue.insert(1, 0, vec![0]);

        queue.truncate_after(0, 4);
        assert_eq!(queue.pending_trees(), vec![0]);
        assert_eq!(queue.gather(0, 3, 100), vec![3, 4]);
        assert_eq!(queue.next_position(), Some(5));
    }
}
