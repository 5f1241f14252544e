// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Storage backend interface (spec §6 "External interfaces").
//!
//! The tree never persists anything itself; every read and write of a node
//! or the head goes through this trait. Backends must return nodes
//! equal-by-value to what was last written (a deep clone on read, since the
//! caller may go on to mutate the returned value).

mod memory;

pub use memory::MemoryBackend;

use crate::error::TreeResult;
use crate::node::{Head, Node, NodeId};

/// Node-level and head-level persistence, consumed by the tree and MVCC
/// layers. Implementations may be disk-based, remote, or (as in
/// [`MemoryBackend`]) purely in-process.
pub trait Backend<K, V>: Send + Sync {
    /// Generates a fresh, non-empty, backend-unique node id.
    ///
    /// `is_leaf` is advisory: a backend may encode the discriminator into
    /// the id if it wishes, but is not required to.
    fn new_id(&self, is_leaf: bool) -> TreeResult<NodeId>;

    fn read(&self, id: &NodeId) -> TreeResult<Node<K, V>>;

    fn write(&self, node: &Node<K, V>) -> TreeResult<()>;

    fn delete(&self, id: &NodeId) -> TreeResult<()>;

    fn exists(&self, id: &NodeId) -> TreeResult<bool>;

    fn read_head(&self) -> TreeResult<Option<Head>>;

    fn write_head(&self, head: &Head) -> TreeResult<()>;

    /// Atomic compare-and-swap of the head: succeeds only if the
    /// currently-stored head's version equals `expected_version`. On
    /// success the new root and version (`expected_version + 1`) are
    /// installed and returned.
    fn cas_head(
        &self,
        expected_version: u64,
        new_root: Option<NodeId>,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> TreeResult<bool>;
}

#[cfg(feature = "async")]
pub mod asynchronous {
    //! Async mirror of [`super::Backend`], used by the asynchronous engine.
    //!
    //! Every method corresponds 1:1 to a synchronous counterpart; this is
    //! the only seam where the sync and async engines differ (spec §5).
    use crate::error::TreeResult;
    use crate::node::{Head, Node, NodeId};
    use async_trait::async_trait;

    #[async_trait]
    pub trait AsyncBackend<K, V>: Send + Sync
    where
        K: Send + Sync,
        V: Send + Sync,
    {
        async fn new_id(&self, is_leaf: bool) -> TreeResult<NodeId>;
        async fn read(&self, id: &NodeId) -> TreeResult<Node<K, V>>;
        async fn write(&self, node: &Node<K, V>) -> TreeResult<()>;
        async fn delete(&self, id: &NodeId) -> TreeResult<()>;
        async fn exists(&self, id: &NodeId) -> TreeResult<bool>;
        async fn read_head(&self) -> TreeResult<Option<Head>>;
        async fn write_head(&self, head: &Head) -> TreeResult<()>;
        async fn cas_head(
            &self,
            expected_version: u64,
            new_root: Option<NodeId>,
            data: serde_json::Map<String, serde_json::Value>,
        ) -> TreeResult<bool>;
    }
}
