//! End-to-end B+tree tests over a real buffer manager and segment files.

use corten_buffer::{BufferManager, BufferManagerConfig};
use corten_common::page::PAGE_SIZE;
use corten_index::{is_leaf, leaf_capacity, BTree, InnerRef, LeafRef};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Barrier;
use tempfile::tempdir;

const LEAF_CAP: u64 = leaf_capacity::<u64, u64>() as u64;

fn create_manager(page_count: usize) -> (BufferManager, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let config = BufferManagerConfig {
        page_size: PAGE_SIZE,
        page_count,
        data_dir: dir.path().to_path_buf(),
        fsync_enabled: false,
    };
    (BufferManager::new(config).unwrap(), dir)
}

#[test]
fn lookup_in_empty_tree() {
    let (manager, _dir) = create_manager(100);
    let tree = BTree::<u64, u64>::new(0, &manager).unwrap();

    assert_eq!(tree.lookup(&42).unwrap(), None);
}

#[test]
fn fill_single_leaf() {
    let (manager, _dir) = create_manager(100);
    let tree = BTree::<u64, u64>::new(0, &manager).unwrap();

    for i in 0..LEAF_CAP {
        tree.insert(i, 2 * i).unwrap();
        assert_eq!(
            tree.lookup(&i).unwrap(),
            Some(2 * i),
            "just inserted key {i} is missing"
        );
    }

    // The root is still a full leaf.
    let root = manager.fix_page(tree.root_pid(), false).unwrap();
    assert!(is_leaf(root.data()));
    assert_eq!(LeafRef::<u64, u64>::new(root.data()).count() as u64, LEAF_CAP);
    manager.unfix_page(root, false);

    for i in 0..LEAF_CAP {
        assert_eq!(tree.lookup(&i).unwrap(), Some(2 * i), "key {i} is missing");
    }
}

#[test]
fn first_split_grows_root() {
    let (manager, _dir) = create_manager(100);
    let tree = BTree::<u64, u64>::new(0, &manager).unwrap();

    for i in 0..LEAF_CAP {
        tree.insert(i, 2 * i).unwrap();
    }

    // Let there be a split...
    tree.insert(424242, 42).unwrap();

    let root = manager.fix_page(tree.root_pid(), false).unwrap();
    assert!(!is_leaf(root.data()), "first split must create an inner root");
    assert_eq!(InnerRef::<u64>::new(root.data()).count(), 2);
    manager.unfix_page(root, false);
    assert_eq!(tree.height(), 2);

    assert_eq!(tree.lookup(&424242).unwrap(), Some(42));
    for i in 0..LEAF_CAP {
        assert_eq!(tree.lookup(&i).unwrap(), Some(2 * i), "key {i} is missing");
    }
}

#[test]
fn increasing_inserts_over_many_splits() {
    let (manager, _dir) = create_manager(100);
    let tree = BTree::<u64, u64>::new(0, &manager).unwrap();
    let n = 10 * LEAF_CAP;

    for i in 0..n {
        tree.insert(i, 2 * i).unwrap();
        assert_eq!(tree.lookup(&i).unwrap(), Some(2 * i));
    }

    for i in 0..n {
        assert_eq!(tree.lookup(&i).unwrap(), Some(2 * i), "key {i} is missing");
    }
}

#[test]
fn decreasing_inserts_keep_earlier_keys() {
    let (manager, _dir) = create_manager(100);
    let tree = BTree::<u64, u64>::new(0, &manager).unwrap();
    let n = 10 * LEAF_CAP;

    for i in (1..=n).rev() {
        tree.insert(i, 2 * i).unwrap();

        for j in (i..=n).rev() {
            assert_eq!(
                tree.lookup(&j).unwrap(),
                Some(2 * j),
                "after inserting {i}, key {j} is missing"
            );
        }
    }
}

#[test]
fn random_non_repeating_inserts() {
    let (manager, _dir) = create_manager(100);
    let tree = BTree::<u64, u64>::new(0, &manager).unwrap();
    let n = 10 * LEAF_CAP;

    let mut keys: Vec<u64> = (n..2 * n).collect();
    let mut rng = StdRng::seed_from_u64(0);
    keys.shuffle(&mut rng);

    for (i, &key) in keys.iter().enumerate() {
        tree.insert(key, 2 * key).unwrap();
        assert_eq!(
            tree.lookup(&key).unwrap(),
            Some(2 * key),
            "just inserted key {key} missing after {i} inserts"
        );
    }

    for &key in &keys {
        assert_eq!(tree.lookup(&key).unwrap(), Some(2 * key), "key {key} is missing");
    }
}

#[test]
fn random_repeating_inserts_update_in_place() {
    let (manager, _dir) = create_manager(100);
    let tree = BTree::<u64, u64>::new(0, &manager).unwrap();
    let n = 10 * LEAF_CAP;

    let mut rng = StdRng::seed_from_u64(0);
    let mut values = [0u64; 100];

    for i in 1..n {
        let key = rng.gen_range(0..100u64);
        values[key as usize] = i;
        tree.insert(key, i).unwrap();

        assert_eq!(
            tree.lookup(&key).unwrap(),
            Some(i),
            "overwriting key {key} with value {i} failed"
        );
    }

    for (key, &value) in values.iter().enumerate() {
        if value == 0 {
            continue;
        }
        assert_eq!(tree.lookup(&(key as u64)).unwrap(), Some(value));
    }
}

#[test]
fn erase_all_keys_in_order() {
    let (manager, _dir) = create_manager(100);
    let tree = BTree::<u64, u64>::new(0, &manager).unwrap();
    let n = 2 * LEAF_CAP;

    for i in 0..n {
        tree.insert(i, 2 * i).unwrap();
    }

    for i in 0..n {
        assert_eq!(tree.lookup(&i).unwrap(), Some(2 * i), "key {i} vanished early");
        assert!(tree.erase(&i).unwrap(), "key {i} was not in the tree");
        assert_eq!(tree.lookup(&i).unwrap(), None, "key {i} was not removed");
        assert!(!tree.erase(&i).unwrap(), "key {i} erased twice");

        // Everything not yet erased is still there.
        for j in (i + 1)..n {
            assert_eq!(tree.lookup(&j).unwrap(), Some(2 * j), "key {j} lost by erase of {i}");
        }
    }
}

#[test]
fn erase_of_absent_key_leaves_tree_unchanged() {
    let (manager, _dir) = create_manager(100);
    let tree = BTree::<u64, u64>::new(0, &manager).unwrap();

    for i in 0..LEAF_CAP {
        tree.insert(i, 2 * i).unwrap();
    }

    assert!(!tree.erase(&(LEAF_CAP + 7)).unwrap());
    for i in 0..LEAF_CAP {
        assert_eq!(tree.lookup(&i).unwrap(), Some(2 * i));
    }
}

#[test]
fn concurrent_writers_on_disjoint_ranges() {
    let (manager, _dir) = create_manager(128);
    let tree = BTree::<u64, u64>::new(0, &manager).unwrap();

    let threads = 36u64;
    let keys_per_thread = 2 * LEAF_CAP;
    let barrier = Barrier::new(threads as usize);

    std::thread::scope(|s| {
        for thread in 0..threads {
            let tree = &tree;
            let barrier = &barrier;
            s.spawn(move || {
                let start = thread * keys_per_thread;
                let limit = start + keys_per_thread;

                for i in start..limit {
                    tree.insert(i, 2 * i).unwrap();
                }

                // No latch is held here.
                barrier.wait();

                for i in start..limit {
                    assert_eq!(
                        tree.lookup(&i).unwrap(),
                        Some(2 * i),
                        "thread {thread} lost key {i}"
                    );
                }
            });
        }
    });
}

#[test]
fn tree_spans_evictions_of_its_own_pages() {
    // A pool far smaller than the tree forces node pages through eviction
    // and reload during the workload.
    let (manager, _dir) = create_manager(8);
    let tree = BTree::<u64, u64>::new(0, &manager).unwrap();
    let n = 20 * LEAF_CAP;

    for i in 0..n {
        tree.insert(i, 2 * i).unwrap();
    }

    for i in 0..n {
        assert_eq!(tree.lookup(&i).unwrap(), Some(2 * i), "key {i} is missing");
    }
}
