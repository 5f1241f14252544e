// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Universal properties against the public facade (spec §8).
//!
//! Internal structural invariants (order preservation, leaf-chain
//! well-formedness, key uniqueness) are exercised directly against
//! `Transaction` in `src/mvcc/transaction.rs`'s own test module, which has
//! access to the node chain; this file covers the properties observable
//! purely through `Tree`.

use mvbtree::{MemoryBackend, NaturalComparator, Tree, TreeConfig};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn fresh_tree(order: u32) -> Tree<i32, i32, MemoryBackend<i32, i32>> {
    let tree = Tree::new(
        MemoryBackend::new(),
        Arc::new(NaturalComparator),
        TreeConfig::new(order),
    );
    tree.init(order, Default::default()).unwrap();
    tree
}

proptest! {
    #[test]
    fn round_trip_holds_for_every_committed_entry(
        entries in prop::collection::vec((-500i32..500, -500i32..500), 1..80)
    ) {
        let tree = fresh_tree(4);
        let mut last_value_for_key = std::collections::HashMap::new();
        for &(k, v) in &entries {
            if let Some(&old) = last_value_for_key.get(&k) {
                tree.delete(k, old).unwrap();
            }
            tree.insert(k, v).unwrap();
            last_value_for_key.insert(k, v);
        }
        for (&k, &v) in &last_value_for_key {
            prop_assert_eq!(tree.get(&k).unwrap(), Some(v));
            prop_assert!(tree.exists(&k, &v).unwrap());
        }
    }

    #[test]
    fn idempotent_insert_is_equivalent_to_a_single_insert(
        k in -1000i32..1000, v in -1000i32..1000
    ) {
        let once = fresh_tree(5);
        once.insert(k, v).unwrap();

        let twice = fresh_tree(5);
        twice.insert(k, v).unwrap();
        twice.insert(k, v).unwrap();

        prop_assert_eq!(once.get(&k).unwrap(), twice.get(&k).unwrap());
        once.delete(k, v).unwrap();
        twice.delete(k, v).unwrap();
        prop_assert_eq!(once.get(&k).unwrap(), None);
        prop_assert_eq!(twice.get(&k).unwrap(), None);
    }

    #[test]
    fn structural_integrity_survives_insert_then_full_delete(
        values in prop::collection::hash_set(-200i32..200, 1..60)
    ) {
        let tree = fresh_tree(4);
        let values: Vec<i32> = values.into_iter().collect();
        for &v in &values {
            tree.insert(v, v * 10).unwrap();
        }
        for &v in &values {
            tree.delete(v, v * 10).unwrap();
        }
        for &v in &values {
            prop_assert_eq!(tree.get(&v).unwrap(), None);
        }
        // The tree must behave exactly as a fresh one: insert/get round-trips.
        tree.insert(999, 9990).unwrap();
        prop_assert_eq!(tree.get(&999).unwrap(), Some(9990));
    }
}

#[test]
fn snapshot_isolation_across_a_concurrent_commit() {
    let tree = fresh_tree(4);
    tree.insert(1, 100).unwrap();

    let tx_a = tree.create_transaction().unwrap();
    assert_eq!(tx_a.get(&1).unwrap(), Some(100));

    tree.insert(2, 200).unwrap();

    assert_eq!(
        tx_a.get(&2).unwrap(),
        None,
        "tx_a's snapshot must not observe a commit that happened after it opened"
    );
    let _ = tx_a.rollback();
    assert_eq!(tree.get(&2).unwrap(), Some(200));
}

#[test]
fn commit_succeeds_only_if_no_commit_happened_since_the_snapshot() {
    let tree = fresh_tree(4);
    tree.insert(1, 100).unwrap();

    let mut tx_a = tree.create_transaction().unwrap();
    let mut tx_b = tree.create_transaction().unwrap();

    tx_a.insert(2, 200).unwrap();
    tx_b.insert(3, 300).unwrap();

    let outcome_a = tx_a.commit(true).unwrap();
    assert!(outcome_a.success);

    let outcome_b = tx_b.commit(true).unwrap();
    assert!(
        !outcome_b.success,
        "tx_b's snapshot predates tx_a's commit, so its commit must be rejected"
    );
}

#[test]
fn atomicity_on_conflict_leaves_committed_state_unchanged() {
    let tree = fresh_tree(4);
    tree.insert(1, 100).unwrap();
    tree.insert(2, 200).unwrap();

    let mut tx_a = tree.create_transaction().unwrap();
    let mut tx_b = tree.create_transaction().unwrap();

    tx_a.insert(10, 1000).unwrap();
    tx_b.insert(20, 2000).unwrap();

    assert!(tx_a.commit(true).unwrap().success);
    assert!(!tx_b.commit(true).unwrap().success);

    // Keys untouched by the losing transaction are unaffected.
    assert_eq!(tree.get(&1).unwrap(), Some(100));
    assert_eq!(tree.get(&2).unwrap(), Some(200));
    assert_eq!(tree.get(&10).unwrap(), Some(1000));
    // The losing transaction's own write never took effect.
    assert_eq!(tree.get(&20).unwrap(), None);
}

#[test]
fn balance_holds_across_many_interleaved_inserts_and_deletes() {
    let tree = fresh_tree(4);
    let mut live: HashSet<i32> = HashSet::new();
    for round in 0..5 {
        for v in round * 40..(round + 1) * 40 {
            tree.insert(v, v).unwrap();
            live.insert(v);
        }
        for v in (round * 40..(round + 1) * 40).step_by(3) {
            tree.delete(v, v).unwrap();
            live.remove(&v);
        }
    }
    for &v in &live {
        assert_eq!(tree.get(&v).unwrap(), Some(v));
    }
}
