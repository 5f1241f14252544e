// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! The six concrete scenarios from spec §8, each with literal inputs and
//! expected outputs.

use mvbtree::{Comparator, Condition, MemoryBackend, NaturalComparator, Tree, TreeConfig};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

fn fresh_tree<K, V>(order: u32, comparator: Arc<dyn Comparator<V>>) -> Tree<K, V, MemoryBackend<K, V>>
where
    K: Clone + Eq + std::hash::Hash + Ord + Send + Sync,
    V: Clone + Send + Sync,
{
    let tree = Tree::new(MemoryBackend::new(), comparator, TreeConfig::new(order));
    tree.init(order, Default::default()).unwrap();
    tree
}

#[test]
fn scenario_1_simple_insert_and_query() {
    let tree: Tree<String, i32, _> = fresh_tree(5, Arc::new(NaturalComparator));
    tree.insert("a".into(), 1).unwrap();
    tree.insert("b".into(), 2).unwrap();
    tree.insert("c".into(), 3).unwrap();
    tree.delete("b".into(), 2).unwrap();

    let by = |m: HashMap<String, i32>| -> Vec<(String, i32)> {
        let mut v: Vec<_> = m.into_iter().collect();
        v.sort();
        v
    };

    assert_eq!(
        by(tree.where_(Condition::new().equal(1), None).unwrap()),
        vec![("a".to_string(), 1)]
    );
    assert_eq!(
        by(tree.where_(Condition::new().gt(1), None).unwrap()),
        vec![("c".to_string(), 3)]
    );
    assert_eq!(
        by(tree.where_(Condition::new().lt(2), None).unwrap()),
        vec![("a".to_string(), 1)]
    );
    assert_eq!(
        by(tree.where_(Condition::new().gt(0).lt(4), None).unwrap()),
        vec![("a".to_string(), 1), ("c".to_string(), 3)]
    );
    assert_eq!(
        by(tree.where_(Condition::new().or(vec![3, 1]), None).unwrap()),
        vec![("a".to_string(), 1), ("c".to_string(), 3)]
    );
}

#[test]
fn scenario_2_split_and_merge_round_trip() {
    let tree: Tree<i32, i32, _> = fresh_tree(4, Arc::new(NaturalComparator));
    for i in 1..=100 {
        tree.insert(i, i * 100).unwrap();
    }

    let mut tx = tree.create_transaction().unwrap();
    for i in 1..=50 {
        tx.delete(i, i * 100).unwrap();
    }
    for i in 1..=50 {
        assert_eq!(tx.get(&i).unwrap(), None);
    }
    assert_eq!(tx.get(&51).unwrap(), Some(5100));
    let _ = tx.rollback();

    for i in 1..=100 {
        assert_eq!(tree.get(&i).unwrap(), Some(i * 100));
    }

    tree.insert(101, 10100).unwrap();
    assert_eq!(tree.get(&1).unwrap(), Some(100));
    assert_eq!(tree.get(&101).unwrap(), Some(10100));
}

#[test]
fn scenario_3_mvcc_isolation() {
    let tree: Tree<i32, i32, _> = fresh_tree(3, Arc::new(NaturalComparator));
    tree.insert(1, 100).unwrap();

    let mut tx_a = tree.create_transaction().unwrap();
    assert_eq!(tx_a.get(&1).unwrap(), Some(100));

    tree.insert(2, 200).unwrap();

    assert_eq!(tx_a.get(&2).unwrap(), None);

    tx_a.insert(3, 300).unwrap();
    let outcome = tx_a.commit(true).unwrap();
    assert!(!outcome.success, "head advanced since tx_a's snapshot");

    assert_eq!(tree.get(&1).unwrap(), Some(100));
    assert_eq!(tree.get(&2).unwrap(), Some(200));
    assert_eq!(tree.get(&3).unwrap(), None);
}

#[test]
fn scenario_4_conflict_fan_out() {
    let tree: Tree<String, i32, _> = fresh_tree(4, Arc::new(NaturalComparator));
    tree.insert("shared".into(), -1).unwrap();

    let mut txs: Vec<_> = (0..5)
        .map(|_| tree.create_transaction().unwrap())
        .collect();

    for (i, tx) in txs.iter_mut().enumerate() {
        tx.delete("shared".into(), -1).unwrap();
        tx.insert("shared".into(), i as i32).unwrap();
        tx.insert(format!("unique_{i}"), i as i32).unwrap();
    }

    let mut successes = 0;
    let mut winner = None;
    for (i, tx) in txs.into_iter().enumerate() {
        let outcome = tx.commit(true).unwrap();
        if outcome.success {
            successes += 1;
            winner = Some(i as i32);
        }
    }
    assert_eq!(successes, 1, "exactly one of the five conflicting commits must win");
    let w = winner.unwrap();

    assert_eq!(tree.get(&"shared".to_string()).unwrap(), Some(w + 1));
    assert_eq!(
        tree.get(&format!("unique_{w}")).unwrap(),
        Some(w),
        "the winner's own unique key must be present"
    );
    for i in 0..5 {
        if i != w {
            assert_eq!(
                tree.get(&format!("unique_{i}")).unwrap(),
                None,
                "a losing transaction's unique key must not appear"
            );
        }
    }
}

#[test]
fn scenario_5_pattern_query() {
    let tree: Tree<String, String, _> = fresh_tree(4, Arc::new(NaturalComparator));
    tree.insert("k1".into(), "apple".into()).unwrap();
    tree.insert("k2".into(), "banana".into()).unwrap();
    tree.insert("k3".into(), "apricot".into()).unwrap();
    tree.insert("k4".into(), "date".into()).unwrap();

    let mut result: Vec<_> = tree
        .where_(Condition::new().like("ap%"), None)
        .unwrap()
        .into_iter()
        .collect();
    result.sort();
    assert_eq!(
        result,
        vec![
            ("k1".to_string(), "apple".to_string()),
            ("k3".to_string(), "apricot".to_string()),
        ]
    );

    let names: Tree<String, String, _> = fresh_tree(4, Arc::new(NaturalComparator));
    names.insert("k1".into(), "John Doe".into()).unwrap();
    names.insert("k2".into(), "Jane Doe".into()).unwrap();
    names.insert("k3".into(), "Alice Smith".into()).unwrap();

    let mut suffix: Vec<_> = names
        .where_(Condition::new().like("% Doe"), None)
        .unwrap()
        .into_iter()
        .collect();
    suffix.sort();
    assert_eq!(
        suffix,
        vec![
            ("k1".to_string(), "John Doe".to_string()),
            ("k2".to_string(), "Jane Doe".to_string()),
        ]
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Composite {
    group: i32,
    id: i32,
}

struct CompositeComparator;

impl Comparator<Composite> for CompositeComparator {
    fn asc(&self, a: &Composite, b: &Composite) -> Ordering {
        (a.group, a.id).cmp(&(b.group, b.id))
    }

    fn pattern_match(&self, v: &Composite) -> String {
        format!("{}-{}", v.group, v.id)
    }

    fn primary_asc(&self, a: &Composite, b: &Composite) -> Ordering {
        a.group.cmp(&b.group)
    }
}

#[test]
fn scenario_6_composite_primary() {
    let tree: Tree<String, Composite, _> = fresh_tree(4, Arc::new(CompositeComparator));
    for g in 1..=10 {
        for i in 1..=20 {
            tree.insert(format!("k-{g}-{i}"), Composite { group: g, id: i })
                .unwrap();
        }
    }

    let equal = tree
        .where_(Condition::new().primary_equal(Composite { group: 5, id: 0 }), None)
        .unwrap();
    assert_eq!(equal.len(), 20);
    assert!(equal.values().all(|v| v.group == 5));

    let gt = tree
        .where_(Condition::new().primary_gt(Composite { group: 5, id: 0 }), None)
        .unwrap();
    assert_eq!(gt.len(), 100);
    assert!(gt.values().all(|v| v.group > 5));

    let or = tree
        .where_(
            Condition::new().primary_or(vec![
                Composite { group: 2, id: 0 },
                Composite { group: 5, id: 0 },
                Composite { group: 8, id: 0 },
            ]),
            None,
        )
        .unwrap();
    assert_eq!(or.len(), 60);
    assert!(or.values().all(|v| [2, 5, 8].contains(&v.group)));
}
