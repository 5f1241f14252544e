// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Bounded in-memory node cache (spec §4.6).
//!
//! Transparent to the tree algorithmic layer: a miss falls through to the
//! backend. Entries are evicted on commit for every dirty/deleted id; a
//! capacity-driven least-recently-used eviction keeps memory bounded
//! between commits.

use crate::node::{Node, NodeId};
use parking_lot::Mutex;
use std::collections::HashMap;

struct Slot<K, V> {
    node: Node<K, V>,
    /// Monotonically increasing touch counter; lower is older.
    last_used: u64,
}

struct Inner<K, V> {
    slots: HashMap<NodeId, Slot<K, V>>,
    clock: u64,
}

/// Bounded node-id -> node cache shared by one engine instance.
pub struct Cache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> Cache<K, V>
where
    K: Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                clock: 0,
            }),
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<Node<K, V>> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;
        let node = inner.slots.get_mut(id).map(|slot| {
            slot.last_used = clock;
            slot.node.clone()
        });
        node
    }

    pub fn put(&self, node: Node<K, V>) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;
        if inner.slots.len() >= self.capacity && !inner.slots.contains_key(&node.id) {
            self.evict_one(&mut inner);
        }
        inner.slots.insert(
            node.id.clone(),
            Slot {
                node,
                last_used: clock,
            },
        );
    }

    pub fn invalidate(&self, id: &NodeId) {
        self.inner.lock().slots.remove(id);
    }

    /// Purges every entry. Public surface is `Tree::force_update`.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.slots.len();
        inner.slots.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    fn evict_one(&self, inner: &mut Inner<K, V>) {
        if let Some(oldest_id) = inner
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(id, _)| id.clone())
        {
            inner.slots.remove(&oldest_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    #[test]
    fn put_then_get_roundtrips() {
        let cache: Cache<String, i32> = Cache::new(8);
        let node: Node<String, i32> = Node::new_leaf("n1".to_string());
        cache.put(node);
        assert!(cache.get(&"n1".to_string()).is_some());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache: Cache<String, i32> = Cache::new(2);
        cache.put(Node::new_leaf("a".to_string()));
        cache.put(Node::new_leaf("b".to_string()));
        // touch a so b becomes the oldest
        let _ = cache.get(&"a".to_string());
        cache.put(Node::new_leaf("c".to_string()));
        assert!(cache.get(&"b".to_string()).is_none());
        assert!(cache.get(&"a".to_string()).is_some());
        assert!(cache.get(&"c".to_string()).is_some());
    }

    #[test]
    fn clear_purges_everything() {
        let cache: Cache<String, i32> = Cache::new(8);
        cache.put(Node::new_leaf("a".to_string()));
        cache.put(Node::new_leaf("b".to_string()));
        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.len(), 0);
    }
}
