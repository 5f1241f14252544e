// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous engine variant (spec §5).
//!
//! Shares the algorithmic core in [`crate::tree`] with the synchronous
//! engine; the only difference is that every backend call suspends.
//! `AsyncTree`/`AsyncTransaction` mirror `Tree`/`Transaction` operation for
//! operation, including delete-side merge/redistribute rebalance and the
//! full query planner and streaming surface. The two engines differ only
//! in whether `read`/`write`/`delete`/`read_head`/`write_head`/`new_id`
//! suspend (spec §5).

mod scan;

pub use scan::AsyncScanStream;

use crate::backend::asynchronous::AsyncBackend;
use crate::cache::Cache;
use crate::comparator::Comparator;
use crate::error::{TreeError, TreeResult};
use crate::mvcc::{CommitOutcome, ObsoleteCache};
use crate::node::{Head, Node, NodeId, NodeKeys};
use crate::query::{Condition, LikeCache};
use crate::tree;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

struct AsyncShared<K, V, B> {
    backend: B,
    comparator: Arc<dyn Comparator<V>>,
    cache: Cache<K, V>,
    obsolete: ObsoleteCache<K, V>,
    like_cache: LikeCache,
    watermarks: parking_lot::Mutex<HashMap<u64, u64>>,
    next_tx_id: AtomicU64,
}

impl<K, V, B> AsyncShared<K, V, B> {
    fn min_watermark(&self) -> Option<u64> {
        self.watermarks.lock().values().copied().min()
    }
}

/// Async counterpart of [`crate::Tree`].
pub struct AsyncTree<K, V, B> {
    shared: Arc<AsyncShared<K, V, B>>,
    initialized: AtomicBool,
}

impl<K, V, B> AsyncTree<K, V, B>
where
    K: Clone + Eq + std::hash::Hash + Ord + Send + Sync,
    V: Clone + Send + Sync,
    B: AsyncBackend<K, V>,
{
    pub fn new(backend: B, comparator: Arc<dyn Comparator<V>>, cache_capacity: usize) -> Self {
        Self {
            shared: Arc::new(AsyncShared {
                backend,
                comparator,
                cache: Cache::new(cache_capacity),
                obsolete: ObsoleteCache::new(),
                like_cache: LikeCache::default(),
                watermarks: parking_lot::Mutex::new(HashMap::new()),
                next_tx_id: AtomicU64::new(0),
            }),
            initialized: AtomicBool::new(false),
        }
    }

    /// Loads an existing head or bootstraps an empty tree (spec §3
    /// "Lifecycles", §6). Idempotent on a freshly constructed engine,
    /// rejected afterwards, mirroring `Tree::init`'s guard.
    pub async fn init(
        &self,
        order: u32,
        initial_head_data: serde_json::Map<String, serde_json::Value>,
    ) -> TreeResult<()> {
        if self
            .initialized
            .compare_exchange(false, true, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
            .is_err()
        {
            return Err(TreeError::LifecycleViolation {
                reason: "init() called more than once on this engine instance".to_string(),
            });
        }
        if order < 3 {
            return Err(TreeError::InvalidOrder { order });
        }
        if self.shared.backend.read_head().await?.is_none() {
            let leaf_id = self.shared.backend.new_id(true).await?;
            let leaf: Node<K, V> = Node::new_leaf(leaf_id.clone());
            self.shared.backend.write(&leaf).await?;
            let mut head = Head::new(order);
            head.root = Some(leaf_id);
            head.data = initial_head_data;
            self.shared.backend.write_head(&head).await?;
        }
        Ok(())
    }

    pub async fn create_transaction(&self) -> TreeResult<AsyncTransaction<K, V, B>> {
        AsyncTransaction::begin(self.shared.clone()).await
    }

    pub async fn insert(&self, key: K, value: V) -> TreeResult<()> {
        let mut tx = self.create_transaction().await?;
        tx.insert(key, value).await?;
        let outcome = tx.commit(true).await?;
        if !outcome.success {
            return Err(TreeError::CommitConflict {
                expected: 0,
                observed: 0,
            });
        }
        Ok(())
    }

    pub async fn delete(&self, key: K, value: V) -> TreeResult<()> {
        let mut tx = self.create_transaction().await?;
        tx.delete(key, value).await?;
        let outcome = tx.commit(true).await?;
        if !outcome.success {
            return Err(TreeError::CommitConflict {
                expected: 0,
                observed: 0,
            });
        }
        Ok(())
    }

    pub async fn get(&self, key: &K) -> TreeResult<Option<V>> {
        let tx = self.create_transaction().await?;
        let result = tx.get(key).await;
        let _ = tx.rollback();
        result
    }

    pub async fn exists(&self, key: &K, value: &V) -> TreeResult<bool> {
        let tx = self.create_transaction().await?;
        let result = tx.exists(key, value).await;
        let _ = tx.rollback();
        result
    }

    /// Auto-transaction convenience counterpart of `Transaction::where_`
    /// (spec §6 "On tree").
    pub async fn where_(
        &self,
        condition: Condition<V>,
        limit: Option<usize>,
    ) -> TreeResult<HashMap<K, V>> {
        let tx = self.create_transaction().await?;
        let result = tx.where_(condition, limit).await;
        let _ = tx.rollback();
        result
    }

    /// Auto-transaction convenience counterpart of `Transaction::keys`.
    pub async fn keys(&self, condition: Condition<V>, limit: Option<usize>) -> TreeResult<HashSet<K>> {
        let tx = self.create_transaction().await?;
        let result = tx.keys::<fn(&K, &V) -> bool>(condition, None, limit).await;
        let _ = tx.rollback();
        result
    }
}

/// Async counterpart of [`crate::mvcc::Transaction`].
pub struct AsyncTransaction<K, V, B> {
    shared: Arc<AsyncShared<K, V, B>>,
    tx_id: u64,
    order: u32,
    initial_head_version: u64,
    initial_head_data: serde_json::Map<String, serde_json::Value>,
    root_id: Option<NodeId>,
    working: HashMap<NodeId, Node<K, V>>,
    originals: HashMap<NodeId, Node<K, V>>,
    created: HashSet<NodeId>,
    dirty: HashSet<NodeId>,
    deleted: HashSet<NodeId>,
    terminated: bool,
}

impl<K, V, B> AsyncTransaction<K, V, B>
where
    K: Clone + Eq + std::hash::Hash + Ord + Send + Sync,
    V: Clone + Send + Sync,
    B: AsyncBackend<K, V>,
{
    async fn begin(shared: Arc<AsyncShared<K, V, B>>) -> TreeResult<Self> {
        let head = shared
            .backend
            .read_head()
            .await?
            .ok_or_else(|| TreeError::LifecycleViolation {
                reason: "tree has not been initialised".to_string(),
            })?;
        let tx_id = shared.next_tx_id.fetch_add(1, AtomicOrdering::SeqCst);
        shared.watermarks.lock().insert(tx_id, head.version);
        Ok(Self {
            shared,
            tx_id,
            order: head.order,
            initial_head_version: head.version,
            initial_head_data: head.data,
            root_id: head.root,
            working: HashMap::new(),
            originals: HashMap::new(),
            created: HashSet::new(),
            dirty: HashSet::new(),
            deleted: HashSet::new(),
            terminated: false,
        })
    }

    pub fn root_id(&self) -> Option<NodeId> {
        self.root_id.clone()
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn comparator(&self) -> &dyn Comparator<V> {
        self.shared.comparator.as_ref()
    }

    fn ensure_active(&self) -> TreeResult<()> {
        if self.terminated {
            return Err(TreeError::LifecycleViolation {
                reason: "operation attempted on a terminated transaction".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) async fn read_node(&self, id: &NodeId) -> TreeResult<Node<K, V>> {
        if self.deleted.contains(id) {
            return Err(TreeError::DeletedNodeRead { id: id.clone() });
        }
        if let Some(node) = self.working.get(id) {
            return Ok(node.clone());
        }
        if let Some(node) = self.shared.cache.get(id) {
            return Ok(node);
        }
        match self.shared.backend.read(id).await {
            Ok(node) => {
                self.shared.cache.put(node.clone());
                Ok(node)
            }
            Err(TreeError::MissingNode { .. }) => self
                .shared
                .obsolete
                .get(id)
                .ok_or_else(|| TreeError::MissingNode { id: id.clone() }),
            Err(e) => Err(e),
        }
    }

    async fn touch(&mut self, id: &NodeId) -> TreeResult<()> {
        if self.working.contains_key(id) {
            return Ok(());
        }
        let node = self.read_node(id).await?;
        if !self.created.contains(id) {
            self.originals.entry(id.clone()).or_insert_with(|| node.clone());
            self.dirty.insert(id.clone());
        }
        self.working.insert(id.clone(), node);
        Ok(())
    }

    async fn new_leaf(&mut self) -> TreeResult<NodeId> {
        let id = self.shared.backend.new_id(true).await?;
        self.working.insert(id.clone(), Node::new_leaf(id.clone()));
        self.created.insert(id.clone());
        Ok(id)
    }

    async fn new_internal(&mut self, values: Vec<V>, children: Vec<NodeId>) -> TreeResult<NodeId> {
        let id = self.shared.backend.new_id(false).await?;
        self.working
            .insert(id.clone(), Node::new_internal(id.clone(), values, children));
        self.created.insert(id.clone());
        Ok(id)
    }

    fn remove_node(&mut self, id: &NodeId) {
        self.working.remove(id);
        if !self.created.remove(id) {
            self.dirty.remove(id);
            self.deleted.insert(id.clone());
        }
    }

    pub async fn leftmost_leaf_id(&self) -> TreeResult<Option<NodeId>> {
        let Some(root) = self.root_id.clone() else {
            return Ok(None);
        };
        let mut current = root;
        loop {
            let node = self.read_node(&current).await?;
            if node.leaf {
                return Ok(Some(current));
            }
            current = node.keys.as_children()[0].clone();
        }
    }

    pub async fn get(&self, key: &K) -> TreeResult<Option<V>> {
        self.ensure_active()?;
        let Some(mut leaf_id) = self.leftmost_leaf_id().await? else {
            return Ok(None);
        };
        loop {
            let leaf = self.read_node(&leaf_id).await?;
            for (i, set) in leaf.keys.as_leaf().iter().enumerate() {
                if set.contains(key) {
                    return Ok(Some(leaf.values[i].clone()));
                }
            }
            match leaf.next.clone() {
                Some(next) => leaf_id = next,
                None => return Ok(None),
            }
        }
    }

    pub async fn exists(&self, key: &K, value: &V) -> TreeResult<bool> {
        self.ensure_active()?;
        let Some(root) = self.root_id.clone() else {
            return Ok(false);
        };
        let cmp = self.shared.comparator.clone();
        let mut current = root;
        let leaf = loop {
            let node = self.read_node(&current).await?;
            if node.leaf {
                break node;
            }
            let idx = tree::child_index(cmp.as_ref(), &node.values, value);
            current = node.keys.as_children()[idx].clone();
        };
        match tree::leaf_position(cmp.as_ref(), &leaf.values, value) {
            Ok(idx) => Ok(leaf.keys.as_leaf()[idx].contains(key)),
            Err(_) => Ok(false),
        }
    }

    /// Full conjunctive query, materialised into a map (spec §4.4, §6).
    pub async fn where_(
        &self,
        condition: Condition<V>,
        limit: Option<usize>,
    ) -> TreeResult<HashMap<K, V>> {
        self.ensure_active()?;
        let mut out = HashMap::new();
        let mut stream = AsyncScanStream::new(self, condition, &self.shared.like_cache, limit).await?;
        while let Some((k, v)) = stream.next().await? {
            out.insert(k, v);
        }
        Ok(out)
    }

    /// `filter`, when given, is a secondary predicate over `(key, value)`
    /// applied after the condition's own conjunction (spec §6 `keys(condition,
    /// filter?)`).
    pub async fn keys<F>(
        &self,
        condition: Condition<V>,
        filter: Option<F>,
        limit: Option<usize>,
    ) -> TreeResult<HashSet<K>>
    where
        F: Fn(&K, &V) -> bool,
    {
        self.ensure_active()?;
        let mut out = HashSet::new();
        let mut stream = AsyncScanStream::new(self, condition, &self.shared.like_cache, limit).await?;
        while let Some((k, v)) = stream.next().await? {
            if filter.as_ref().map(|f| f(&k, &v)).unwrap_or(true) {
                out.insert(k);
            }
        }
        Ok(out)
    }

    /// Lazy streaming counterpart of [`Self::where_`]; dropping the stream
    /// ends the scan (spec §4.5).
    pub async fn where_stream(
        &self,
        condition: Condition<V>,
        limit: Option<usize>,
    ) -> TreeResult<AsyncScanStream<'_, K, V, B>> {
        self.ensure_active()?;
        AsyncScanStream::new(self, condition, &self.shared.like_cache, limit).await
    }

    pub async fn keys_stream(
        &self,
        condition: Condition<V>,
        limit: Option<usize>,
    ) -> TreeResult<AsyncScanStream<'_, K, V, B>> {
        self.ensure_active()?;
        AsyncScanStream::new(self, condition, &self.shared.like_cache, limit).await
    }

    /// Leaf insert plus split propagation (spec §4.2). Mirrors
    /// `Transaction::insert`; see there for the rationale behind each step.
    pub async fn insert(&mut self, key: K, value: V) -> TreeResult<()> {
        self.ensure_active()?;
        let cmp = self.shared.comparator.clone();

        let Some(root) = self.root_id.clone() else {
            let leaf_id = self.new_leaf().await?;
            let leaf = self.working.get_mut(&leaf_id).unwrap();
            leaf.values.push(value);
            leaf.keys.as_leaf_mut().push(BTreeSet::from([key]));
            self.root_id = Some(leaf_id);
            return Ok(());
        };

        let mut path_ids = Vec::new();
        {
            let mut current = root;
            loop {
                self.touch(&current).await?;
                let is_leaf = self.working[&current].leaf;
                let next = if is_leaf {
                    None
                } else {
                    let idx =
                        tree::child_index(cmp.as_ref(), &self.working[&current].values, &value);
                    Some(self.working[&current].keys.as_children()[idx].clone())
                };
                path_ids.push(current.clone());
                match next {
                    Some(n) => current = n,
                    None => break,
                }
            }
        }

        let leaf_id = path_ids.last().unwrap().clone();
        match tree::leaf_position(cmp.as_ref(), &self.working[&leaf_id].values, &value) {
            Ok(idx) => {
                self.working.get_mut(&leaf_id).unwrap().keys.as_leaf_mut()[idx].insert(key);
            }
            Err(idx) => {
                {
                    let leaf = self.working.get_mut(&leaf_id).unwrap();
                    leaf.values.insert(idx, value);
                    leaf.keys.as_leaf_mut().insert(idx, BTreeSet::from([key]));
                }
                if self.working[&leaf_id].values.len() >= self.order as usize {
                    self.split_leaf(&path_ids).await?;
                }
            }
        }
        Ok(())
    }

    async fn split_leaf(&mut self, path_ids: &[NodeId]) -> TreeResult<()> {
        let leaf_id = path_ids.last().unwrap().clone();
        let mid = tree::leaf_split_mid(self.order);
        let (right_values, right_keys, old_next) = {
            let leaf = self.working.get_mut(&leaf_id).unwrap();
            let right_values = leaf.values.split_off(mid + 1);
            let right_keys = leaf.keys.as_leaf_mut().split_off(mid + 1);
            (right_values, right_keys, leaf.next.clone())
        };
        let right_id = self.new_leaf().await?;
        {
            let right = self.working.get_mut(&right_id).unwrap();
            right.values = right_values;
            right.keys = NodeKeys::Leaf(right_keys);
            right.next = old_next.clone();
            right.prev = Some(leaf_id.clone());
        }
        self.working.get_mut(&leaf_id).unwrap().next = Some(right_id.clone());
        if let Some(next_id) = old_next {
            self.touch(&next_id).await?;
            self.working.get_mut(&next_id).unwrap().prev = Some(right_id.clone());
        }
        let separator = self.working[&right_id].values[0].clone();

        if path_ids.len() == 1 {
            let new_root = self
                .new_internal(vec![separator], vec![leaf_id.clone(), right_id.clone()])
                .await?;
            self.working.get_mut(&leaf_id).unwrap().parent = Some(new_root.clone());
            self.working.get_mut(&right_id).unwrap().parent = Some(new_root.clone());
            self.root_id = Some(new_root);
        } else {
            let parent_id = path_ids[path_ids.len() - 2].clone();
            self.working.get_mut(&right_id).unwrap().parent = Some(parent_id.clone());
            Box::pin(self.insert_into_parent(
                &parent_id,
                &leaf_id,
                separator,
                right_id,
                &path_ids[..path_ids.len() - 1],
            ))
            .await?;
        }
        Ok(())
    }

    async fn insert_into_parent(
        &mut self,
        parent_id: &NodeId,
        left_child: &NodeId,
        separator: V,
        right_child: NodeId,
        ancestor_path: &[NodeId],
    ) -> TreeResult<()> {
        let idx = self.working[parent_id]
            .keys
            .as_children()
            .iter()
            .position(|c| c == left_child)
            .expect("left child must be present in its parent");
        {
            let parent = self.working.get_mut(parent_id).unwrap();
            parent.values.insert(idx, separator);
            parent.keys.as_children_mut().insert(idx + 1, right_child);
        }
        if self.working[parent_id].keys.as_children().len() > self.order as usize {
            Box::pin(self.split_internal(parent_id, ancestor_path)).await?;
        }
        Ok(())
    }

    async fn split_internal(&mut self, node_id: &NodeId, ancestor_path: &[NodeId]) -> TreeResult<()> {
        let left_count = tree::internal_split_left_count(self.order);
        let (mid_value, right_values, right_children) = {
            let node = self.working.get_mut(node_id).unwrap();
            let children = node.keys.as_children_mut();
            let right_children = children.split_off(left_count);
            let right_values = node.values.split_off(left_count);
            let mid_value = node.values.pop().expect("internal split always has a middle value");
            (mid_value, right_values, right_children)
        };

        let right_id = self.new_internal(right_values, right_children.clone()).await?;
        for child in &right_children {
            self.touch(child).await?;
            self.working.get_mut(child).unwrap().parent = Some(right_id.clone());
        }

        if ancestor_path.len() == 1 {
            let new_root = self
                .new_internal(vec![mid_value], vec![node_id.clone(), right_id.clone()])
                .await?;
            self.working.get_mut(node_id).unwrap().parent = Some(new_root.clone());
            self.working.get_mut(&right_id).unwrap().parent = Some(new_root.clone());
            self.root_id = Some(new_root);
        } else {
            let parent_id = ancestor_path[ancestor_path.len() - 2].clone();
            self.working.get_mut(&right_id).unwrap().parent = Some(parent_id.clone());
            Box::pin(self.insert_into_parent(
                &parent_id,
                node_id,
                mid_value,
                right_id,
                &ancestor_path[..ancestor_path.len() - 1],
            ))
            .await?;
        }
        Ok(())
    }

    /// Mirrors `Transaction::delete`; see there for the rebalance rationale.
    pub async fn delete(&mut self, key: K, value: V) -> TreeResult<()> {
        self.ensure_active()?;
        let Some(root) = self.root_id.clone() else {
            return Ok(());
        };
        let cmp = self.shared.comparator.clone();

        let mut path_ids = Vec::new();
        {
            let mut current = root;
            loop {
                self.touch(&current).await?;
                let is_leaf = self.working[&current].leaf;
                let next = if is_leaf {
                    None
                } else {
                    let idx =
                        tree::child_index(cmp.as_ref(), &self.working[&current].values, &value);
                    Some(self.working[&current].keys.as_children()[idx].clone())
                };
                path_ids.push(current.clone());
                match next {
                    Some(n) => current = n,
                    None => break,
                }
            }
        }

        let leaf_id = path_ids.last().unwrap().clone();
        let idx = match tree::leaf_position(cmp.as_ref(), &self.working[&leaf_id].values, &value) {
            Ok(idx) => idx,
            Err(_) => return Ok(()),
        };
        let became_empty = {
            let leaf = self.working.get_mut(&leaf_id).unwrap();
            let set = &mut leaf.keys.as_leaf_mut()[idx];
            set.remove(&key);
            set.is_empty()
        };
        if !became_empty {
            return Ok(());
        }
        {
            let leaf = self.working.get_mut(&leaf_id).unwrap();
            leaf.values.remove(idx);
            leaf.keys.as_leaf_mut().remove(idx);
        }
        Box::pin(self.fix_after_shrink(&path_ids)).await?;
        Ok(())
    }

    async fn fix_after_shrink(&mut self, path: &[NodeId]) -> TreeResult<()> {
        let node_id = path.last().unwrap().clone();

        if path.len() == 1 {
            let is_internal = !self.working[&node_id].leaf;
            if is_internal && self.working[&node_id].keys.as_children().len() == 1 {
                let only_child = self.working[&node_id].keys.as_children()[0].clone();
                self.touch(&only_child).await?;
                self.working.get_mut(&only_child).unwrap().parent = None;
                self.remove_node(&node_id);
                self.root_id = Some(only_child);
            }
            return Ok(());
        }

        let order = self.order;
        let underflow = if self.working[&node_id].leaf {
            self.working[&node_id].values.len() < tree::min_leaf_values(order)
        } else {
            self.working[&node_id].keys.as_children().len() < tree::min_children(order)
        };
        if !underflow {
            return Ok(());
        }

        let parent_id = path[path.len() - 2].clone();
        let is_leaf = self.working[&node_id].leaf;
        let siblings = self.working[&parent_id].keys.as_children().clone();
        let my_index = siblings.iter().position(|c| *c == node_id).unwrap();

        let deficient_is_left = my_index == 0;
        let (left_id, right_id) = if deficient_is_left {
            (node_id.clone(), siblings[my_index + 1].clone())
        } else {
            (siblings[my_index - 1].clone(), node_id.clone())
        };
        self.touch(&left_id).await?;
        self.touch(&right_id).await?;

        let left_size = if is_leaf {
            self.working[&left_id].values.len()
        } else {
            self.working[&left_id].keys.as_children().len()
        };
        let right_size = if is_leaf {
            self.working[&right_id].values.len()
        } else {
            self.working[&right_id].keys.as_children().len()
        };
        let parent_sep_index = siblings
            .iter()
            .position(|c| *c == left_id)
            .expect("left sibling must appear in parent's child list");

        let should_merge = if is_leaf {
            left_size + right_size < order as usize
        } else {
            left_size + right_size <= order as usize
        };

        if should_merge {
            self.merge_nodes(&left_id, &right_id, &parent_id, parent_sep_index, is_leaf)
                .await?;
            Box::pin(self.fix_after_shrink(&path[..path.len() - 1])).await?;
        } else {
            self.redistribute(
                &left_id,
                &right_id,
                &parent_id,
                parent_sep_index,
                is_leaf,
                deficient_is_left,
            )
            .await?;
        }
        Ok(())
    }

    async fn merge_nodes(
        &mut self,
        left_id: &NodeId,
        right_id: &NodeId,
        parent_id: &NodeId,
        sep_index: usize,
        is_leaf: bool,
    ) -> TreeResult<()> {
        if is_leaf {
            let (right_values, right_keys, right_next) = {
                let right = self.working.get_mut(right_id).unwrap();
                (
                    std::mem::take(&mut right.values),
                    std::mem::take(right.keys.as_leaf_mut()),
                    right.next.clone(),
                )
            };
            {
                let left = self.working.get_mut(left_id).unwrap();
                left.values.extend(right_values);
                left.keys.as_leaf_mut().extend(right_keys);
                left.next = right_next.clone();
            }
            if let Some(next_id) = right_next {
                self.touch(&next_id).await?;
                self.working.get_mut(&next_id).unwrap().prev = Some(left_id.clone());
            }
        } else {
            let sep_value = self.working[parent_id].values[sep_index].clone();
            let (right_values, right_children) = {
                let right = self.working.get_mut(right_id).unwrap();
                let values = std::mem::take(&mut right.values);
                let children = std::mem::take(right.keys.as_children_mut());
                (values, children)
            };
            for child in &right_children {
                self.touch(child).await?;
                self.working.get_mut(child).unwrap().parent = Some(left_id.clone());
            }
            let left = self.working.get_mut(left_id).unwrap();
            left.values.push(sep_value);
            left.values.extend(right_values);
            left.keys.as_children_mut().extend(right_children);
        }
        self.remove_node(right_id);
        let parent = self.working.get_mut(parent_id).unwrap();
        parent.values.remove(sep_index);
        parent.keys.as_children_mut().remove(sep_index + 1);
        Ok(())
    }

    async fn redistribute(
        &mut self,
        left_id: &NodeId,
        right_id: &NodeId,
        parent_id: &NodeId,
        sep_index: usize,
        is_leaf: bool,
        deficient_is_left: bool,
    ) -> TreeResult<()> {
        if is_leaf {
            if deficient_is_left {
                let (v, k) = {
                    let right = self.working.get_mut(right_id).unwrap();
                    (right.values.remove(0), right.keys.as_leaf_mut().remove(0))
                };
                {
                    let left = self.working.get_mut(left_id).unwrap();
                    left.values.push(v);
                    left.keys.as_leaf_mut().push(k);
                }
                let new_sep = self.working[right_id].values[0].clone();
                self.working.get_mut(parent_id).unwrap().values[sep_index] = new_sep;
            } else {
                let (v, k) = {
                    let left = self.working.get_mut(left_id).unwrap();
                    (
                        left.values.pop().expect("surplus sibling is non-empty"),
                        left.keys.as_leaf_mut().pop().expect("surplus sibling is non-empty"),
                    )
                };
                {
                    let right = self.working.get_mut(right_id).unwrap();
                    right.values.insert(0, v.clone());
                    right.keys.as_leaf_mut().insert(0, k);
                }
                self.working.get_mut(parent_id).unwrap().values[sep_index] = v;
            }
        } else if deficient_is_left {
            let sep_value = self.working[parent_id].values[sep_index].clone();
            let first_child = self.working.get_mut(right_id).unwrap().keys.as_children_mut().remove(0);
            let first_value = self.working.get_mut(right_id).unwrap().values.remove(0);
            self.touch(&first_child).await?;
            self.working.get_mut(&first_child).unwrap().parent = Some(left_id.clone());
            {
                let left = self.working.get_mut(left_id).unwrap();
                left.values.push(sep_value);
                left.keys.as_children_mut().push(first_child);
            }
            self.working.get_mut(parent_id).unwrap().values[sep_index] = first_value;
        } else {
            let sep_value = self.working[parent_id].values[sep_index].clone();
            let last_child = self
                .working
                .get_mut(left_id)
                .unwrap()
                .keys
                .as_children_mut()
                .pop()
                .expect("surplus sibling has a child to lend");
            let last_value = self.working.get_mut(left_id).unwrap().values.pop().unwrap();
            self.touch(&last_child).await?;
            self.working.get_mut(&last_child).unwrap().parent = Some(right_id.clone());
            {
                let right = self.working.get_mut(right_id).unwrap();
                right.values.insert(0, sep_value);
                right.keys.as_children_mut().insert(0, last_child);
            }
            self.working.get_mut(parent_id).unwrap().values[sep_index] = last_value;
        }
        Ok(())
    }

    pub async fn commit(mut self, cleanup: bool) -> TreeResult<CommitOutcome> {
        self.ensure_active()?;
        self.terminated = true;

        let mut id_map: HashMap<NodeId, NodeId> = HashMap::new();
        for id in &self.dirty {
            let is_leaf = self.working[id].leaf;
            let new_id = self.shared.backend.new_id(is_leaf).await?;
            id_map.insert(id.clone(), new_id);
        }
        let remap = |id: &NodeId, id_map: &HashMap<NodeId, NodeId>| -> NodeId {
            id_map.get(id).cloned().unwrap_or_else(|| id.clone())
        };

        let mut final_nodes = Vec::with_capacity(self.working.len());
        for (orig_id, mut node) in self.working.drain() {
            let final_id = remap(&orig_id, &id_map);
            node.id = final_id.clone();
            if let Some(p) = &node.parent {
                node.parent = Some(remap(p, &id_map));
            }
            if let Some(n) = &node.next {
                node.next = Some(remap(n, &id_map));
            }
            if let Some(p) = &node.prev {
                node.prev = Some(remap(p, &id_map));
            }
            if let NodeKeys::Internal(children) = &mut node.keys {
                for c in children.iter_mut() {
                    *c = remap(c, &id_map);
                }
            }
            final_nodes.push(node);
        }
        let final_root = self.root_id.as_ref().map(|r| remap(r, &id_map));

        let mut written = Vec::with_capacity(final_nodes.len());
        for node in &final_nodes {
            if let Err(e) = self.shared.backend.write(node).await {
                for w in &written {
                    let _ = self.shared.backend.delete(w).await;
                }
                self.shared.watermarks.lock().remove(&self.tx_id);
                return Err(e);
            }
            written.push(node.id.clone());
        }

        let cas_ok = self
            .shared
            .backend
            .cas_head(
                self.initial_head_version,
                final_root,
                self.initial_head_data.clone(),
            )
            .await?;

        if !cas_ok {
            for w in &written {
                let _ = self.shared.backend.delete(w).await;
            }
            let observed = self
                .shared
                .backend
                .read_head()
                .await?
                .map(|h| h.version)
                .unwrap_or(self.initial_head_version);
            self.shared.watermarks.lock().remove(&self.tx_id);
            self.shared.obsolete.gc(self.shared.min_watermark());
            return Ok(CommitOutcome {
                success: false,
                created: Vec::new(),
                obsolete: Vec::new(),
                error: Some(
                    TreeError::CommitConflict {
                        expected: self.initial_head_version,
                        observed,
                    }
                    .to_string(),
                ),
            });
        }

        let new_version = self.initial_head_version + 1;
        let mut obsolete_ids = Vec::new();
        for id in self.dirty.iter().chain(self.deleted.iter()) {
            self.shared.cache.invalidate(id);
            if let Some(original) = self.originals.remove(id) {
                self.shared.obsolete.retire(original, new_version);
            }
            if cleanup {
                let _ = self.shared.backend.delete(id).await;
            }
            obsolete_ids.push(id.clone());
        }
        self.shared.watermarks.lock().remove(&self.tx_id);
        self.shared.obsolete.gc(self.shared.min_watermark());

        Ok(CommitOutcome {
            success: true,
            created: written,
            obsolete: obsolete_ids,
            error: None,
        })
    }

    pub fn rollback(mut self) -> TreeResult<CommitOutcome> {
        self.ensure_active()?;
        self.terminated = true;
        self.shared.watermarks.lock().remove(&self.tx_id);
        self.shared.obsolete.gc(self.shared.min_watermark());
        Ok(CommitOutcome {
            success: true,
            created: Vec::new(),
            obsolete: Vec::new(),
            error: None,
        })
    }
}

impl<K, V, B> Drop for AsyncTransaction<K, V, B> {
    fn drop(&mut self) {
        if !self.terminated {
            self.shared.watermarks.lock().remove(&self.tx_id);
        }
    }
}
