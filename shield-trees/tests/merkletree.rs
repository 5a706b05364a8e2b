use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use shield_trees::config::{Chain, MerkletreeConfig, PerformanceLevel};
use shield_trees::error::{ConsistencyError, MerkletreeError};
use shield_trees::hash::{empty_root, hash_left_right, zero};
use shield_trees::{AcceptAll, MemoryDatabase, Merkletree, Node, TREE_DEPTH, verify_proof};

mod common;
use common::{FlakyValidator, TestLeaf, TestTree, leaves, reference_root, test_tree};

#[tokio::test]
async fn empty_tree_root_is_folded_zero_chain() {
    let tree = test_tree(PerformanceLevel::High, AcceptAll).await;

    let mut expected = zero(0);
    for _ in 0..TREE_DEPTH {
        expected = hash_left_right(&expected, &expected);
    }
    assert_eq!(tree.get_root(0).await.unwrap(), expected);
    assert_eq!(tree.get_root(3).await.unwrap(), empty_root());
    assert_eq!(tree.get_tree_length(0).await, 0);
    assert_eq!(tree.latest_tree().await, None);
}

#[tokio::test]
async fn concrete_vector_matches_rebuild() {
    let tree = test_tree(PerformanceLevel::High, AcceptAll).await;
    let first: Vec<TestLeaf> = (1..=4).map(|value| TestLeaf(Node::from_u64(value))).collect();
    tree.queue_leaves(0, 0, first).await;
    tree.update_trees_from_write_queue().await.unwrap();
    tree.queue_leaves(0, 4, vec![TestLeaf(Node::from_u64(5))]).await;
    tree.update_trees_from_write_queue().await.unwrap();

    assert_eq!(tree.get_tree_length(0).await, 5);
    let incremental_root = tree.get_root(0).await.unwrap();
    let hashes: Vec<Node> = (1..=5).map(Node::from_u64).collect();
    assert_eq!(incremental_root, reference_root(&hashes));

    tree.rebuild_and_write_tree(0).await.unwrap();
    assert_eq!(tree.get_root(0).await.unwrap(), incremental_root);
    assert_eq!(tree.get_tree_length(0).await, 5);
}

#[tokio::test]
async fn rebuild_matches_incremental_commits() {
    let tree = test_tree(PerformanceLevel::Low, AcceptAll).await;
    for (start, end) in [(0, 3), (3, 4), (4, 37), (37, 300)] {
        tree.queue_leaves(0, start, leaves(start..end)).await;
        tree.update_trees_from_write_queue().await.unwrap();
    }
    assert_eq!(tree.get_tree_length(0).await, 300);
    let incremental_root = tree.get_root(0).await.unwrap();
    let hashes: Vec<Node> = leaves(0..300).into_iter().map(|leaf| leaf.0).collect();
    assert_eq!(incremental_root, reference_root(&hashes));

    tree.rebuild_and_write_tree(0).await.unwrap();
    assert_eq!(tree.get_root(0).await.unwrap(), incremental_root);
    for index in [0, 17, 299] {
        let proof = tree.get_merkle_proof(0, index).await.unwrap();
        assert!(verify_proof(&proof));
    }
}

#[tokio::test]
async fn proofs_verify_and_detect_tampering() {
    let tree = test_tree(PerformanceLevel::High, AcceptAll).await;
    tree.queue_leaves(0, 0, leaves(0..11)).await;
    tree.update_trees_from_write_queue().await.unwrap();

    for index in 0..11 {
        let proof = tree.get_merkle_proof(0, index).await.unwrap();
        assert_eq!(proof.leaf, Node::from_u64(index + 1));
        assert_eq!(proof.root, tree.get_root(0).await.unwrap());
        assert!(verify_proof(&proof));
    }

    let proof = tree.get_merkle_proof(0, 6).await.unwrap();
    for level in 0..TREE_DEPTH {
        let mut tampered = proof.clone();
        tampered.elements[level] = Node::from_u64(12345);
        assert!(!verify_proof(&tampered));
    }
    let mut wrong_root = proof.clone();
    wrong_root.root = Node::from_u64(1);
    assert!(!verify_proof(&wrong_root));

    let mut wrong_indices = proof.clone();
    wrong_indices.indices = Node::from_u64(7);
    assert!(!verify_proof(&wrong_indices));

    let mut permuted = proof.clone();
    permuted.elements.swap(0, 1);
    assert!(!verify_proof(&permuted));
}

#[tokio::test]
async fn stale_batches_are_ignored_and_gaps_wait() {
    let tree = test_tree(PerformanceLevel::High, AcceptAll).await;
    tree.queue_leaves(0, 0, leaves(0..4)).await;
    tree.update_trees_from_write_queue().await.unwrap();
    let root = tree.get_root(0).await.unwrap();

    tree.queue_leaves(0, 2, vec![TestLeaf(Node::from_u64(999))]).await;
    tree.update_trees_from_write_queue().await.unwrap();
    assert_eq!(tree.get_tree_length(0).await, 4);
    assert_eq!(tree.get_root(0).await.unwrap(), root);

    tree.queue_leaves(0, 6, leaves(6..8)).await;
    tree.update_trees_from_write_queue().await.unwrap();
    assert_eq!(tree.get_tree_length(0).await, 4);
    assert_eq!(tree.get_root(0).await.unwrap(), root);
    assert_eq!(tree.next_write_position().await, 8);

    tree.queue_leaves(0, 4, leaves(4..6)).await;
    tree.update_trees_from_write_queue().await.unwrap();
    assert_eq!(tree.get_tree_length(0).await, 8);
    let hashes: Vec<Node> = leaves(0..8).into_iter().map(|leaf| leaf.0).collect();
    assert_eq!(tree.get_root(0).await.unwrap(), reference_root(&hashes));
}

#[tokio::test]
async fn backoff_isolates_the_first_invalid_leaf() {
    const VALID_LEAVES: u64 = 57;

    for performance_level in [
        PerformanceLevel::Low,
        PerformanceLevel::Medium,
        PerformanceLevel::High,
        PerformanceLevel::Maximum,
    ] {
        let tree = test_tree(performance_level, |tree: u32, last_index: u64, _root: &Node| {
            tree != 0 || last_index < VALID_LEAVES
        })
        .await;
        tree.queue_leaves(0, 0, leaves(0..VALID_LEAVES + 1)).await;
        tree.queue_leaves(1, 0, leaves(0..3)).await;
        tree.update_trees_from_write_queue().await.unwrap();

        assert_eq!(tree.get_tree_length(0).await, VALID_LEAVES);
        assert_eq!(tree.get_tree_length(1).await, 3);
        assert_eq!(
            tree.next_write_position().await,
            shield_trees::global_position(1, 3)
        );
        let hashes: Vec<Node> = leaves(0..VALID_LEAVES)
            .into_iter()
            .map(|leaf| leaf.0)
            .collect();
        assert_eq!(tree.get_root(0).await.unwrap(), reference_root(&hashes));

        // the rejected leaf stays queued for the next pass
        tree.update_trees_from_write_queue().await.unwrap();
        assert_eq!(tree.get_tree_length(0).await, VALID_LEAVES);
        assert!(tree.get_leaf(0, VALID_LEAVES).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn rejected_groups_persist_nothing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted_calls = calls.clone();
    let tree = test_tree(PerformanceLevel::Low, move |_: u32, _: u64, _: &Node| {
        counted_calls.fetch_add(1, Ordering::SeqCst);
        false
    })
    .await;
    tree.queue_leaves(0, 0, leaves(0..5)).await;
    tree.update_trees_from_write_queue().await.unwrap();

    // 200, 40 and 10 all cover the whole batch, then a single leaf
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(tree.get_tree_length(0).await, 0);
    assert_eq!(tree.get_root(0).await.unwrap(), empty_root());
    assert!(tree.get_leaf(0, 0).await.unwrap().is_none());
    assert_eq!(tree.get_node_hash(0, 0, 0).await.unwrap(), zero(0));
}

#[tokio::test]
async fn validator_errors_stop_the_shard_without_backoff() {
    let validator = FlakyValidator::default();
    validator.offline.store(true, Ordering::SeqCst);
    let tree = test_tree(PerformanceLevel::Low, validator.clone()).await;
    tree.queue_leaves(0, 0, leaves(0..5)).await;

    assert!(matches!(
        tree.update_trees_from_write_queue().await,
        Err(MerkletreeError::ValidatorError(_))
    ));
    assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(tree.get_tree_length(0).await, 0);
    assert_eq!(tree.get_root(0).await.unwrap(), empty_root());
    assert_eq!(tree.get_metadata(0).await, None);
    assert_eq!(tree.next_write_position().await, 5);

    validator.offline.store(false, Ordering::SeqCst);
    tree.update_trees_from_write_queue().await.unwrap();
    assert_eq!(validator.calls.load(Ordering::SeqCst), 2);
    assert_eq!(tree.get_tree_length(0).await, 5);
}

#[tokio::test]
async fn rollback_past_the_last_shard_is_rejected() {
    let tree = test_tree(PerformanceLevel::High, AcceptAll).await;
    tree.queue_leaves(0, 0, leaves(0..3)).await;
    tree.update_trees_from_write_queue().await.unwrap();
    let root = tree.get_root(0).await.unwrap();

    assert!(matches!(
        tree.clear_leaves_after_position(u64::MAX).await,
        Err(MerkletreeError::PositionOutOfRange(u64::MAX))
    ));
    assert_eq!(tree.get_tree_length(0).await, 3);
    assert_eq!(tree.get_root(0).await.unwrap(), root);
}

#[tokio::test]
async fn rollback_restores_the_earlier_root() {
    let tree = test_tree(PerformanceLevel::High, AcceptAll).await;
    tree.queue_leaves(0, 0, leaves(0..6)).await;
    tree.update_trees_from_write_queue().await.unwrap();
    let root_at_five = tree.get_root(0).await.unwrap();

    tree.queue_leaves(0, 6, leaves(6..20)).await;
    tree.queue_leaves(0, 25, leaves(25..30)).await;
    tree.update_trees_from_write_queue().await.unwrap();
    assert_ne!(tree.get_root(0).await.unwrap(), root_at_five);

    tree.clear_leaves_after_position(5).await.unwrap();
    assert_eq!(tree.get_tree_length(0).await, 6);
    assert_eq!(tree.get_root(0).await.unwrap(), root_at_five);
    assert!(tree.get_leaf(0, 6).await.unwrap().is_none());
    assert_eq!(tree.get_node_hash(0, 0, 6).await.unwrap(), zero(0));
    assert_eq!(tree.next_write_position().await, 6);

    tree.rebuild_and_write_tree(0).await.unwrap();
    assert_eq!(tree.get_root(0).await.unwrap(), root_at_five);

    // the truncated tree grows again from the rollback position
    tree.queue_leaves(0, 6, vec![TestLeaf(Node::from_u64(500))]).await;
    tree.update_trees_from_write_queue().await.unwrap();
    assert_eq!(tree.get_tree_length(0).await, 7);
    assert!(verify_proof(&tree.get_merkle_proof(0, 6).await.unwrap()));
}

#[tokio::test]
async fn rollback_clears_later_trees() {
    let tree = test_tree(PerformanceLevel::High, AcceptAll).await;
    tree.queue_leaves(0, 0, leaves(0..4)).await;
    tree.queue_leaves(1, 0, leaves(0..4)).await;
    tree.update_trees_from_write_queue().await.unwrap();
    assert_eq!(tree.latest_tree().await, Some(1));

    tree.clear_leaves_after_position(2).await.unwrap();
    assert_eq!(tree.latest_tree().await, Some(0));
    assert_eq!(tree.get_tree_length(0).await, 3);
    assert_eq!(tree.get_tree_length(1).await, 0);
    assert_eq!(tree.get_root(1).await.unwrap(), empty_root());
    assert!(tree.get_leaf(1, 0).await.unwrap().is_none());
}

#[tokio::test]
async fn leaf_records_are_updated_only_with_matching_hash() {
    let tree = test_tree(PerformanceLevel::High, AcceptAll).await;
    tree.queue_leaves(0, 0, leaves(0..2)).await;
    tree.update_trees_from_write_queue().await.unwrap();

    tree.update_leaf(0, 1, TestLeaf(Node::from_u64(2)))
        .await
        .unwrap();
    assert!(matches!(
        tree.update_leaf(0, 1, TestLeaf(Node::from_u64(3))).await,
        Err(MerkletreeError::ConsistencyError(
            ConsistencyError::DataHashMismatch { index: 1, .. }
        ))
    ));
    assert!(matches!(
        tree.update_leaf(0, 2, TestLeaf(Node::from_u64(3))).await,
        Err(MerkletreeError::ConsistencyError(
            ConsistencyError::LeafNotCommitted { index: 2, .. }
        ))
    ));
}

#[tokio::test]
async fn metadata_is_reloaded_from_the_store() {
    let db = Arc::new(MemoryDatabase::new());
    let tree = Merkletree::new(
        Chain::default(),
        MerkletreeConfig::default(),
        TestTree,
        db.clone(),
        AcceptAll,
    )
    .await
    .unwrap();
    tree.queue_leaves(0, 0, leaves(0..9)).await;
    tree.update_trees_from_write_queue().await.unwrap();
    let root = tree.get_root(0).await.unwrap();

    let reloaded = Merkletree::new(
        Chain::default(),
        MerkletreeConfig::default(),
        TestTree,
        db.clone(),
        AcceptAll,
    )
    .await
    .unwrap();
    assert_eq!(reloaded.get_tree_length(0).await, 9);
    assert_eq!(reloaded.get_root(0).await.unwrap(), root);

    let other_chain = Merkletree::new(
        Chain {
            id: 137,
            ..Chain::default()
        },
        MerkletreeConfig::default(),
        TestTree,
        db,
        AcceptAll,
    )
    .await
    .unwrap();
    assert_eq!(other_chain.get_tree_length(0).await, 0);
}

#[tokio::test]
async fn delete_all_resets_every_tree() {
    let tree = test_tree(PerformanceLevel::High, AcceptAll).await;
    tree.queue_leaves(0, 0, leaves(0..3)).await;
    tree.queue_leaves(1, 0, leaves(0..3)).await;
    tree.update_trees_from_write_queue().await.unwrap();
    tree.queue_leaves(1, 10, leaves(10..12)).await;

    tree.delete_all().await.unwrap();
    assert_eq!(tree.latest_tree().await, None);
    assert_eq!(tree.next_write_position().await, 0);
    assert_eq!(tree.get_root(0).await.unwrap(), empty_root());
    assert!(tree.db().is_empty().await);
}
