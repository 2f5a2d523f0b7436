//! Buffer tree end-to-end tests.
//!
//! Covers the reference scenarios on the default block sizes plus randomized
//! insert/delete workloads on small configurations, each checked against an
//! in-memory model and the structural invariants.

use arbor_common::TreeConfig;
use arbor_storage::{BufferTree, Phase, PhaseCounter, TreeShape};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

fn create_tree(memory: usize, block: usize, leaf: usize) -> (BufferTree, TempDir) {
    let dir = tempdir().unwrap();
    let mut config = TreeConfig::new(dir.path(), memory, block, leaf);
    config.fsync_enabled = false;
    (BufferTree::create(config).unwrap(), dir)
}

fn assert_matches_model(tree: &BufferTree, model: &BTreeSet<u64>) -> TreeShape {
    let shape = tree.check_invariants().unwrap();
    let keys = tree.leaf_keys().unwrap();
    assert_eq!(keys, model.iter().copied().collect::<Vec<_>>());
    assert_eq!(shape.keys, model.len());
    assert_eq!(shape.buffered_blocks, 0);
    shape
}

// Scenario A: M = 8192, B = 1024 gives m = 8. 8192 ascending keys fill exactly
// eight leaf blocks under a leaf-level root.
#[test]
fn test_scenario_a_full_leaf_root() {
    let (mut tree, _dir) = create_tree(8192, 1024, 1024);
    let params = *tree.params();
    assert_eq!((params.m, params.a, params.b), (8, 2, 8));

    for key in 0..8192 {
        tree.insert(key).unwrap();
    }
    tree.flush().unwrap();

    let root = tree.load_node(tree.root_id()).unwrap();
    assert!(!root.is_internal);
    assert_eq!(root.children.len(), 8);
    assert_eq!(root.handles.len(), 7);
    assert!(!root.has_buffer());
    assert_eq!(tree.pending_elements(), 0);

    let shape = tree.check_invariants().unwrap();
    assert_eq!(shape.height, 1);
    assert_eq!(shape.leaf_blocks, 8);
    assert_eq!(shape.keys, 8192);
}

// Scenario B: deleting everything from scenario A leaves an empty leaf root.
#[test]
fn test_scenario_b_delete_everything() {
    let (mut tree, _dir) = create_tree(8192, 1024, 1024);
    for key in 0..8192 {
        tree.insert(key).unwrap();
    }
    tree.flush().unwrap();

    for key in 0..8192 {
        tree.delete(key).unwrap();
    }
    tree.flush().unwrap();

    let root = tree.load_node(tree.root_id()).unwrap();
    assert!(!root.is_internal);
    assert!(root.children.is_empty());
    assert!(root.handles.is_empty());
    assert!(tree.leaf_keys().unwrap().is_empty());
    tree.check_invariants().unwrap();
}

// Scenario C: two full top buffers land as two root blocks and nothing else.
#[test]
fn test_scenario_c_root_buffer_blocks() {
    let (mut tree, _dir) = create_tree(8192, 1024, 1024);
    for key in 0..2048 {
        tree.insert(key).unwrap();
    }

    assert_eq!(tree.pending_elements(), 0);
    let root = tree.load_node(tree.root_id()).unwrap();
    assert_eq!(root.buffer_blocks.len(), 2);
    assert_eq!(root.last_block_len, 1024);
    assert_eq!(root.buffered_elements(1024), 2048);
    assert!(root.children.is_empty());
}

#[test]
fn test_insert_then_delete_leaves_key_absent() {
    let (mut tree, _dir) = create_tree(32, 4, 4);
    for key in 0..50 {
        tree.insert(key).unwrap();
    }
    tree.flush().unwrap();

    tree.insert(1000).unwrap();
    tree.delete(1000).unwrap();
    tree.delete(25).unwrap();
    tree.flush().unwrap();

    let keys = tree.leaf_keys().unwrap();
    assert!(!keys.contains(&1000));
    assert!(!keys.contains(&25));
    assert_eq!(keys.len(), 49);
    tree.check_invariants().unwrap();
}

#[test]
fn test_duplicate_inserts_leave_one_copy() {
    let (mut tree, _dir) = create_tree(32, 4, 4);
    for _ in 0..3 {
        for key in [7, 3, 7, 11] {
            tree.insert(key).unwrap();
        }
        tree.flush().unwrap();
    }
    assert_eq!(tree.leaf_keys().unwrap(), vec![3, 7, 11]);
}

#[test]
fn test_descending_inserts_come_out_ascending() {
    let (mut tree, _dir) = create_tree(32, 4, 4);
    let mut model = BTreeSet::new();
    for key in (0..500).rev() {
        tree.insert(key * 3).unwrap();
        model.insert(key * 3);
    }
    tree.flush().unwrap();
    let shape = assert_matches_model(&tree, &model);
    assert!(shape.height >= 3);
}

#[test]
fn test_interleaved_flushes_and_deletes() {
    let (mut tree, _dir) = create_tree(32, 4, 4);
    let mut model = BTreeSet::new();

    for round in 0..5u64 {
        for key in 0..120 {
            tree.insert(round * 1000 + key).unwrap();
            model.insert(round * 1000 + key);
        }
        tree.flush().unwrap();
        assert_matches_model(&tree, &model);

        for key in (0..120).step_by(2) {
            tree.delete(round * 1000 + key).unwrap();
            model.remove(&(round * 1000 + key));
        }
        tree.flush().unwrap();
        assert_matches_model(&tree, &model);
    }
}

#[test]
fn test_random_workload_matches_model() {
    for seed in [1u64, 2, 3] {
        let (mut tree, _dir) = create_tree(32, 4, 4);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut model = BTreeSet::new();

        for step in 0..3000 {
            let key = rng.gen_range(0..400u64);
            if rng.gen_bool(0.6) {
                tree.insert(key).unwrap();
                model.insert(key);
            } else {
                tree.delete(key).unwrap();
                model.remove(&key);
            }
            if step % 700 == 699 {
                tree.flush().unwrap();
                assert_matches_model(&tree, &model);
            }
        }
        tree.flush().unwrap();
        assert_matches_model(&tree, &model);
    }
}

#[test]
fn test_random_workload_larger_fanout() {
    // m = 16: a = 4, b = 16, s = 3, t = 6.
    let (mut tree, _dir) = create_tree(64, 4, 3);
    let mut rng = StdRng::seed_from_u64(42);
    let mut model = BTreeSet::new();

    for _ in 0..4000 {
        let key = rng.gen_range(0..1500u64);
        tree.insert(key).unwrap();
        model.insert(key);
    }
    tree.flush().unwrap();
    assert_matches_model(&tree, &model);

    let mut keys: Vec<u64> = model.iter().copied().collect();
    keys.retain(|_| rng.gen_bool(0.8));
    for key in keys {
        tree.delete(key).unwrap();
        model.remove(&key);
    }
    tree.flush().unwrap();
    assert_matches_model(&tree, &model);
}

#[test]
fn test_smallest_fanout() {
    // m = 4: a = 1, b = 4.
    let (mut tree, _dir) = create_tree(16, 4, 2);
    let mut model = BTreeSet::new();
    for key in 0..300 {
        tree.insert(key).unwrap();
        model.insert(key);
    }
    tree.flush().unwrap();
    assert_matches_model(&tree, &model);

    for key in 0..300 {
        if key % 10 != 0 {
            tree.delete(key).unwrap();
            model.remove(&key);
        }
    }
    tree.flush().unwrap();
    assert_matches_model(&tree, &model);
}

// Scenario B at m = 4, where a = 1 lets whole subtrees empty out.
#[test]
fn test_smallest_fanout_delete_everything() {
    for (leaf, count) in [(1, 20u64), (1, 200), (2, 40), (4, 100)] {
        let (mut tree, _dir) = create_tree(16, 4, leaf);
        for key in 0..count {
            tree.insert(key).unwrap();
        }
        tree.flush().unwrap();
        assert!(tree.check_invariants().unwrap().height >= 3);

        for key in 0..count {
            tree.delete(key).unwrap();
        }
        tree.flush().unwrap();

        assert!(!tree.is_poisoned());
        let root = tree.load_node(tree.root_id()).unwrap();
        assert!(!root.is_internal);
        assert!(root.children.is_empty());
        assert!(root.handles.is_empty());
        assert!(tree.leaf_keys().unwrap().is_empty());
        let shape = tree.check_invariants().unwrap();
        assert_eq!((shape.height, shape.keys, shape.buffered_blocks), (1, 0, 0));
    }
}

#[test]
fn test_io_accounting() {
    let dir = tempdir().unwrap();
    let mut config = TreeConfig::new(dir.path(), 32, 4, 4);
    config.fsync_enabled = false;
    let counter = Arc::new(PhaseCounter::new());
    let mut tree = BufferTree::with_observer(config, counter.clone()).unwrap();

    for key in 0..400 {
        tree.insert(key).unwrap();
    }
    tree.flush().unwrap();
    for key in 0..400 {
        tree.delete(key).unwrap();
    }
    tree.flush().unwrap();

    assert_eq!(counter.count(Phase::Flush), 2);
    assert_eq!(counter.count(Phase::TreeBufferPush), 200);
    assert!(counter.count(Phase::NodeSplit) > 0);
    assert!(counter.count(Phase::NodeMerge) > 0);
    assert!(counter.count(Phase::PlaceholderDeletion) > 0);
    assert!(counter.count(Phase::RootCollapse) > 0);
    assert!(counter.count(Phase::ExternalMergeSort) > 0);
    assert!(counter.io_calls() >= counter.count(Phase::NodeRead));
    assert!(counter
        .snapshot()
        .iter()
        .all(|(phase, count)| *count > 0 && counter.count(*phase) == *count));
}
