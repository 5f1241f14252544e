// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! In-memory reference implementation of [`Backend`](super::Backend).
//!
//! Ids are generated from a monotonically increasing counter (never a
//! UUID — the core only needs non-empty, backend-unique strings). The
//! counter lives in an atomic field rather than the head's opaque `data`
//! map so that `new_id` is available before the head itself exists (the
//! bootstrap leaf created by `Tree::init` needs an id before any head has
//! ever been written).

use crate::error::TreeResult;
use crate::node::{Head, Node, NodeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Purely in-process storage backend. Useful as a reference implementation,
/// in tests, and as the default backend for callers with no durability
/// requirement.
pub struct MemoryBackend<K, V> {
    nodes: RwLock<HashMap<NodeId, Node<K, V>>>,
    head: RwLock<Option<Head>>,
    next_id: AtomicU64,
}

impl<K, V> Default for MemoryBackend<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MemoryBackend<K, V> {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            head: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<K, V> crate::backend::Backend<K, V> for MemoryBackend<K, V>
where
    K: Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn new_id(&self, is_leaf: bool) -> TreeResult<NodeId> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let prefix = if is_leaf { "l" } else { "i" };
        Ok(format!("{prefix}{n}"))
    }

    fn read(&self, id: &NodeId) -> TreeResult<Node<K, V>> {
        self.nodes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| crate::error::TreeError::MissingNode { id: id.clone() })
    }

    fn write(&self, node: &Node<K, V>) -> TreeResult<()> {
        self.nodes
            .write()
            .insert(node.id.clone(), node.clone());
        Ok(())
    }

    fn delete(&self, id: &NodeId) -> TreeResult<()> {
        self.nodes.write().remove(id);
        Ok(())
    }

    fn exists(&self, id: &NodeId) -> TreeResult<bool> {
        Ok(self.nodes.read().contains_key(id))
    }

    fn read_head(&self) -> TreeResult<Option<Head>> {
        Ok(self.head.read().clone())
    }

    fn write_head(&self, head: &Head) -> TreeResult<()> {
        *self.head.write() = Some(head.clone());
        Ok(())
    }

    fn cas_head(
        &self,
        expected_version: u64,
        new_root: Option<NodeId>,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> TreeResult<bool> {
        let mut guard = self.head.write();
        let current_version = guard.as_ref().map(|h| h.version).unwrap_or(0);
        if current_version != expected_version {
            return Ok(false);
        }
        let order = guard.as_ref().map(|h| h.order).unwrap_or(3);
        *guard = Some(Head {
            root: new_root,
            order,
            data,
            version: expected_version + 1,
        });
        Ok(true)
    }
}

#[cfg(feature = "async")]
#[async_trait::async_trait]
impl<K, V> crate::backend::asynchronous::AsyncBackend<K, V> for MemoryBackend<K, V>
where
    K: Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    async fn new_id(&self, is_leaf: bool) -> TreeResult<NodeId> {
        crate::backend::Backend::new_id(self, is_leaf)
    }

    async fn read(&self, id: &NodeId) -> TreeResult<Node<K, V>> {
        crate::backend::Backend::read(self, id)
    }

    async fn write(&self, node: &Node<K, V>) -> TreeResult<()> {
        crate::backend::Backend::write(self, node)
    }

    async fn delete(&self, id: &NodeId) -> TreeResult<()> {
        crate::backend::Backend::delete(self, id)
    }

    async fn exists(&self, id: &NodeId) -> TreeResult<bool> {
        crate::backend::Backend::exists(self, id)
    }

    async fn read_head(&self) -> TreeResult<Option<Head>> {
        crate::backend::Backend::read_head(self)
    }

    async fn write_head(&self, head: &Head) -> TreeResult<()> {
        crate::backend::Backend::write_head(self, head)
    }

    async fn cas_head(
        &self,
        expected_version: u64,
        new_root: Option<NodeId>,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> TreeResult<bool> {
        crate::backend::Backend::cas_head(self, expected_version, new_root, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;

    #[test]
    fn new_id_is_unique_and_non_empty() {
        let backend: MemoryBackend<String, i32> = MemoryBackend::new();
        let a = backend.new_id(true).unwrap();
        let b = backend.new_id(false).unwrap();
        assert!(!a.is_empty());
        assert!(!b.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn read_missing_node_errors() {
        let backend: MemoryBackend<String, i32> = MemoryBackend::new();
        let err = backend.read(&"missing".to_string()).unwrap_err();
        assert!(matches!(err, crate::error::TreeError::MissingNode { .. }));
    }

    #[test]
    fn cas_head_rejects_stale_version() {
        let backend: MemoryBackend<String, i32> = MemoryBackend::new();
        backend
            .write_head(&Head {
                root: None,
                order: 4,
                data: serde_json::Map::new(),
                version: 0,
            })
            .unwrap();
        assert!(backend
            .cas_head(0, Some("l1".to_string()), serde_json::Map::new())
            .unwrap());
        assert!(!backend
            .cas_head(0, Some("l2".to_string()), serde_json::Map::new())
            .unwrap());
        assert!(backend
            .cas_head(1, Some("l2".to_string()), serde_json::Map::new())
            .unwrap());
    }
}
