// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Shared obsolete-node cache (spec §4.3, §5, §9).
//!
//! A best-effort read-through buffer that holds nodes retired by a
//! completed commit long enough to serve snapshots still reading them. An
//! entry is safe to drop once no live transaction's watermark predates the
//! commit that retired it.

use crate::node::{Node, NodeId};
use parking_lot::RwLock;
use std::collections::HashMap;

struct Entry<K, V> {
    node: Node<K, V>,
    /// Head version at which this node was retired.
    retired_at: u64,
}

/// Keyed by node id; holds every node version a snapshot reader still in
/// flight could possibly need.
pub struct ObsoleteCache<K, V> {
    entries: RwLock<HashMap<NodeId, Entry<K, V>>>,
}

impl<K, V> Default for ObsoleteCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ObsoleteCache<K, V>
where
    K: Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Records a retired node's original form at the head version that
    /// retired it.
    pub fn retire(&self, node: Node<K, V>, retired_at: u64) {
        self.entries
            .write()
            .insert(node.id.clone(), Entry { node, retired_at });
    }

    /// Looks up a node a snapshot read could not find in the backend
    /// because a concurrent commit already deleted it.
    pub fn get(&self, id: &NodeId) -> Option<Node<K, V>> {
        self.entries.read().get(id).map(|e| e.node.clone())
    }

    /// Drops every entry retired at or before `min_active_watermark`: no
    /// transaction still open could have a snapshot old enough to need
    /// them. `None` means no transaction is open, so everything is free.
    pub fn gc(&self, min_active_watermark: Option<u64>) {
        let mut entries = self.entries.write();
        match min_active_watermark {
            None => entries.clear(),
            Some(watermark) => entries.retain(|_, e| e.retired_at >= watermark),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    #[test]
    fn retire_then_get_roundtrips() {
        let cache: ObsoleteCache<String, i32> = ObsoleteCache::new();
        let node: Node<String, i32> = Node::new_leaf("l1".to_string());
        cache.retire(node, 5);
        assert!(cache.get(&"l1".to_string()).is_some());
        assert!(cache.get(&"missing".to_string()).is_none());
    }

    #[test]
    fn gc_drops_entries_below_watermark() {
        let cache: ObsoleteCache<String, i32> = ObsoleteCache::new();
        cache.retire(Node::new_leaf("old".to_string()), 1);
        cache.retire(Node::new_leaf("new".to_string()), 10);
        cache.gc(Some(5));
        assert!(cache.get(&"old".to_string()).is_none());
        assert!(cache.get(&"new".to_string()).is_some());
    }

    #[test]
    fn gc_with_no_active_transactions_clears_everything() {
        let cache: ObsoleteCache<String, i32> = ObsoleteCache::new();
        cache.retire(Node::new_leaf("a".to_string()), 1);
        cache.gc(None);
        assert!(cache.is_empty());
    }
}
