// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Node and head record types (spec §3 "Data model").
//!
//! `parent`/`next`/`prev` are relation markers, not ownership: they are
//! plain node ids dereferenced through the backend or cache, never owning
//! references. This matches the on-disk serialisation, which carries the
//! same ids.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Opaque node identifier. Non-empty, unique across the tree's lifetime;
/// an id, once retired, is never reused for a different node.
pub type NodeId = String;

/// A leaf or internal node of the tree.
///
/// Leaves carry `keys[i]` as the non-empty set of caller keys associated
/// with `values[i]`; internal nodes carry `keys` as child node ids, one
/// more than `values.len()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node<K, V> {
    pub id: NodeId,
    pub leaf: bool,
    pub values: Vec<V>,
    pub keys: NodeKeys<K>,
    pub parent: Option<NodeId>,
    /// Leaf-only: next leaf in ascending value order.
    pub next: Option<NodeId>,
    /// Leaf-only: previous leaf in ascending value order.
    pub prev: Option<NodeId>,
}

/// The two shapes `keys` can take depending on `leaf`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeKeys<K> {
    /// One non-empty key-set per leaf value, same length as `values`.
    Leaf(Vec<BTreeSet<K>>),
    /// Child node ids, one more than `values.len()`.
    Internal(Vec<NodeId>),
}

impl<K> NodeKeys<K> {
    pub fn as_leaf(&self) -> &Vec<BTreeSet<K>> {
        match self {
            NodeKeys::Leaf(v) => v,
            NodeKeys::Internal(_) => panic!("NodeKeys::as_leaf called on an internal node"),
        }
    }

    pub fn as_leaf_mut(&mut self) -> &mut Vec<BTreeSet<K>> {
        match self {
            NodeKeys::Leaf(v) => v,
            NodeKeys::Internal(_) => panic!("NodeKeys::as_leaf_mut called on an internal node"),
        }
    }

    pub fn as_children(&self) -> &Vec<NodeId> {
        match self {
            NodeKeys::Internal(v) => v,
            NodeKeys::Leaf(_) => panic!("NodeKeys::as_children called on a leaf node"),
        }
    }

    pub fn as_children_mut(&mut self) -> &mut Vec<NodeId> {
        match self {
            NodeKeys::Internal(v) => v,
            NodeKeys::Leaf(_) => panic!("NodeKeys::as_children_mut called on a leaf node"),
        }
    }
}

impl<K, V> Node<K, V> {
    /// Creates an empty leaf node.
    pub fn new_leaf(id: NodeId) -> Self {
        Self {
            id,
            leaf: true,
            values: Vec::new(),
            keys: NodeKeys::Leaf(Vec::new()),
            parent: None,
            next: None,
            prev: None,
        }
    }

    /// Creates an internal node from a separator list and child list.
    ///
    /// `children.len()` must equal `values.len() + 1`.
    pub fn new_internal(id: NodeId, values: Vec<V>, children: Vec<NodeId>) -> Self {
        debug_assert_eq!(children.len(), values.len() + 1);
        Self {
            id,
            leaf: false,
            values,
            keys: NodeKeys::Internal(children),
            parent: None,
            next: None,
            prev: None,
        }
    }

    pub fn distinct_value_count(&self) -> usize {
        self.values.len()
    }

    pub fn child_count(&self) -> usize {
        self.keys.as_children().len()
    }
}

/// Singleton metadata record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Head {
    pub root: Option<NodeId>,
    pub order: u32,
    /// Caller-reserved opaque metadata (e.g. id counters).
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Monotonically increasing version used by `cas_head`.
    pub version: u64,
}

impl Head {
    pub fn new(order: u32) -> Self {
        Self {
            root: None,
            order,
            data: serde_json::Map::new(),
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_leaf_is_empty() {
        let leaf: Node<u32, u32> = Node::new_leaf("n0".to_string());
        assert!(leaf.leaf);
        assert_eq!(leaf.distinct_value_count(), 0);
        assert!(leaf.next.is_none());
        assert!(leaf.prev.is_none());
    }

    #[test]
    fn new_internal_requires_n_plus_one_children() {
        let node: Node<u32, u32> =
            Node::new_internal("n1".to_string(), vec![10], vec!["a".into(), "b".into()]);
        assert_eq!(node.child_count(), node.values.len() + 1);
    }
}
