// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Per-transaction snapshot, copy-on-write working set, and commit/rollback
//! (spec §4.3).

use crate::backend::Backend;
use crate::cache::Cache;
use crate::comparator::Comparator;
use crate::error::{TreeError, TreeResult};
use crate::mvcc::obsolete::ObsoleteCache;
use crate::node::{Head, Node, NodeId, NodeKeys};
use crate::query::{Condition, LikeCache, ScanStream};
use crate::tree;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// State shared by every transaction opened against one engine instance.
pub(crate) struct Shared<K, V, B> {
    pub backend: B,
    pub comparator: Arc<dyn Comparator<V>>,
    pub cache: Cache<K, V>,
    pub obsolete: ObsoleteCache<K, V>,
    pub like_cache: LikeCache,
    pub watermarks: parking_lot::Mutex<HashMap<u64, u64>>,
    pub next_tx_id: AtomicU64,
}

impl<K, V, B> Shared<K, V, B>
where
    K: Clone,
    V: Clone,
{
    /// Lowest `initial_head_version` among all transactions still open, or
    /// `None` if none are open.
    pub fn min_watermark(&self) -> Option<u64> {
        self.watermarks.lock().values().copied().min()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

/// Outcome of `commit`/`rollback` (spec §6 "Public API surface").
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub success: bool,
    pub created: Vec<NodeId>,
    pub obsolete: Vec<NodeId>,
    pub error: Option<String>,
}

/// An isolated snapshot-and-write-buffer workspace (spec §3 "Transaction").
pub struct Transaction<K, V, B> {
    shared: Arc<Shared<K, V, B>>,
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
    state: TxState,
}

impl<K, V, B> Transaction<K, V, B>
where
    K: Clone + Eq + std::hash::Hash + Ord,
    V: Clone,
    B: Backend<K, V>,
{
    pub(crate) fn begin(shared: Arc<Shared<K, V, B>>) -> TreeResult<Self> {
        let head = shared
            .backend
            .read_head()?
            .ok_or_else(|| TreeError::LifecycleViolation {
                reason: "tree has not been initialised".to_string(),
            })?;
        let tx_id = shared.next_tx_id.fetch_add(1, AtomicOrdering::SeqCst);
        shared.watermarks.lock().insert(tx_id, head.version);
        tracing::debug!(tx_id, head_version = head.version, "tx.begin");
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
            state: TxState::Active,
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
        if self.state != TxState::Active {
            return Err(TreeError::LifecycleViolation {
                reason: "operation attempted on a terminated transaction".to_string(),
            });
        }
        Ok(())
    }

    /// Read-only fetch: working set, then engine cache, then backend, then
    /// (on a miss caused by a concurrent commit's cleanup) the shared
    /// obsolete cache.
    pub fn read_node(&self, id: &NodeId) -> TreeResult<Node<K, V>> {
        if self.deleted.contains(id) {
            return Err(TreeError::DeletedNodeRead { id: id.clone() });
        }
        if let Some(node) = self.working.get(id) {
            return Ok(node.clone());
        }
        if let Some(node) = self.shared.cache.get(id) {
            return Ok(node);
        }
        match self.shared.backend.read(id) {
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

    /// Clones `id` into the working set on first touch (copy-on-write),
    /// recording its pre-transaction form for the obsolete cache.
    fn touch(&mut self, id: &NodeId) -> TreeResult<()> {
        if self.working.contains_key(id) {
            return Ok(());
        }
        let node = self.read_node(id)?;
        if !self.created.contains(id) {
            self.originals.entry(id.clone()).or_insert_with(|| node.clone());
            self.dirty.insert(id.clone());
        }
        self.working.insert(id.clone(), node);
        Ok(())
    }

    fn new_leaf(&mut self) -> TreeResult<NodeId> {
        let id = self.shared.backend.new_id(true)?;
        self.working.insert(id.clone(), Node::new_leaf(id.clone()));
        self.created.insert(id.clone());
        Ok(id)
    }

    fn new_internal(&mut self, values: Vec<V>, children: Vec<NodeId>) -> TreeResult<NodeId> {
        let id = self.shared.backend.new_id(false)?;
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

    pub fn leftmost_leaf_id(&self) -> TreeResult<Option<NodeId>> {
        let Some(root) = self.root_id.clone() else {
            return Ok(None);
        };
        let mut current = root;
        loop {
            let node = self.read_node(&current)?;
            if node.leaf {
                return Ok(Some(current));
            }
            current = node.keys.as_children()[0].clone();
        }
    }

    pub fn rightmost_leaf_id(&self) -> TreeResult<Option<NodeId>> {
        let Some(root) = self.root_id.clone() else {
            return Ok(None);
        };
        let mut current = root;
        loop {
            let node = self.read_node(&current)?;
            if node.leaf {
                return Ok(Some(current));
            }
            let children = node.keys.as_children();
            current = children[children.len() - 1].clone();
        }
    }

    /// Reverse lookup: the tree is ordered by value, not key, so finding a
    /// key's value is a leaf-chain scan (spec §1: "keys are the payload").
    pub fn get(&self, key: &K) -> TreeResult<Option<V>> {
        self.ensure_active()?;
        let Some(mut leaf_id) = self.leftmost_leaf_id()? else {
            return Ok(None);
        };
        loop {
            let leaf = self.read_node(&leaf_id)?;
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

    pub fn exists(&self, key: &K, value: &V) -> TreeResult<bool> {
        self.ensure_active()?;
        let Some(root) = self.root_id.clone() else {
            return Ok(false);
        };
        let cmp = self.shared.comparator.clone();
        let path = tree::descend_path(
            cmp.as_ref(),
            root,
            value,
            tree::DescendMode::Asc,
            &mut |id| self.read_node(id),
        )?;
        let leaf = path.last().expect("descend_path always returns a leaf");
        match tree::leaf_position(cmp.as_ref(), &leaf.values, value) {
            Ok(idx) => Ok(leaf.keys.as_leaf()[idx].contains(key)),
            Err(_) => Ok(false),
        }
    }

    /// Full conjunctive query, materialised into a map (spec §4.4, §6).
    pub fn where_(&self, condition: Condition<V>, limit: Option<usize>) -> TreeResult<HashMap<K, V>> {
        self.ensure_active()?;
        let mut out = HashMap::new();
        for item in ScanStream::new(self, condition, &self.shared.like_cache, limit)? {
            let (k, v) = item?;
            out.insert(k, v);
        }
        Ok(out)
    }

    /// `filter`, when given, is a secondary predicate over `(key, value)`
    /// applied after the condition's own conjunction (spec §6 `keys(condition,
    /// filter?)`); it does not affect driver selection or early termination.
    pub fn keys<F>(
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
        for item in ScanStream::new(self, condition, &self.shared.like_cache, limit)? {
            let (k, v) = item?;
            if filter.as_ref().map(|f| f(&k, &v)).unwrap_or(true) {
                out.insert(k);
            }
        }
        Ok(out)
    }

    /// Lazy streaming counterpart of [`Self::where_`]; dropping the
    /// iterator ends the scan (spec §4.5).
    pub fn where_stream(
        &self,
        condition: Condition<V>,
        limit: Option<usize>,
    ) -> TreeResult<ScanStream<'_, K, V, B>> {
        self.ensure_active()?;
        ScanStream::new(self, condition, &self.shared.like_cache, limit)
    }

    pub fn keys_stream<'a, F>(
        &'a self,
        condition: Condition<V>,
        filter: Option<F>,
        limit: Option<usize>,
    ) -> TreeResult<impl Iterator<Item = TreeResult<K>> + 'a>
    where
        F: Fn(&K, &V) -> bool + 'a,
        K: 'a,
        V: 'a,
    {
        self.ensure_active()?;
        Ok(ScanStream::new(self, condition, &self.shared.like_cache, limit)?.filter_map(
            move |r| match r {
                Ok((k, v)) => {
                    if filter.as_ref().map(|f| f(&k, &v)).unwrap_or(true) {
                        Some(Ok(k))
                    } else {
                        None
                    }
                }
                Err(e) => Some(Err(e)),
            },
        ))
    }

    pub fn insert(&mut self, key: K, value: V) -> TreeResult<()> {
        self.ensure_active()?;
        let cmp = self.shared.comparator.clone();

        let Some(root) = self.root_id.clone() else {
            let leaf_id = self.new_leaf()?;
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
                self.touch(&current)?;
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
                    self.split_leaf(&path_ids)?;
                }
            }
        }
        Ok(())
    }

    fn split_leaf(&mut self, path_ids: &[NodeId]) -> TreeResult<()> {
        let leaf_id = path_ids.last().unwrap().clone();
        let mid = tree::leaf_split_mid(self.order);
        let (right_values, right_keys, old_next) = {
            let leaf = self.working.get_mut(&leaf_id).unwrap();
            let right_values = leaf.values.split_off(mid + 1);
            let right_keys = leaf.keys.as_leaf_mut().split_off(mid + 1);
            (right_values, right_keys, leaf.next.clone())
        };
        let right_id = self.new_leaf()?;
        {
            let right = self.working.get_mut(&right_id).unwrap();
            right.values = right_values;
            right.keys = NodeKeys::Leaf(right_keys);
            right.next = old_next.clone();
            right.prev = Some(leaf_id.clone());
        }
        self.working.get_mut(&leaf_id).unwrap().next = Some(right_id.clone());
        if let Some(next_id) = old_next {
            self.touch(&next_id)?;
            self.working.get_mut(&next_id).unwrap().prev = Some(right_id.clone());
        }
        let separator = self.working[&right_id].values[0].clone();

        tracing::debug!(left = %leaf_id, right = %right_id, "tree.split_leaf");

        if path_ids.len() == 1 {
            let new_root = self.new_internal(vec![separator], vec![leaf_id.clone(), right_id.clone()])?;
            self.working.get_mut(&leaf_id).unwrap().parent = Some(new_root.clone());
            self.working.get_mut(&right_id).unwrap().parent = Some(new_root.clone());
            self.root_id = Some(new_root);
        } else {
            let parent_id = path_ids[path_ids.len() - 2].clone();
            self.working.get_mut(&right_id).unwrap().parent = Some(parent_id.clone());
            self.insert_into_parent(
                &parent_id,
                &leaf_id,
                separator,
                right_id,
                &path_ids[..path_ids.len() - 1],
            )?;
        }
        Ok(())
    }

    fn insert_into_parent(
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
            self.split_internal(parent_id, ancestor_path)?;
        }
        Ok(())
    }

    fn split_internal(&mut self, node_id: &NodeId, ancestor_path: &[NodeId]) -> TreeResult<()> {
        let left_count = tree::internal_split_left_count(self.order);
        let (mid_value, right_values, right_children) = {
            let node = self.working.get_mut(node_id).unwrap();
            let children = node.keys.as_children_mut();
            let right_children = children.split_off(left_count);
            let right_values = node.values.split_off(left_count);
            let mid_value = node.values.pop().expect("internal split always has a middle value");
            (mid_value, right_values, right_children)
        };

        tracing::debug!(node = %node_id, "tree.split_internal");

        let right_id = self.new_internal(right_values, right_children.clone())?;
        for child in &right_children {
            self.touch(child)?;
            self.working.get_mut(child).unwrap().parent = Some(right_id.clone());
        }

        if ancestor_path.len() == 1 {
            let new_root =
                self.new_internal(vec![mid_value], vec![node_id.clone(), right_id.clone()])?;
            self.working.get_mut(node_id).unwrap().parent = Some(new_root.clone());
            self.working.get_mut(&right_id).unwrap().parent = Some(new_root.clone());
            self.root_id = Some(new_root);
        } else {
            let parent_id = ancestor_path[ancestor_path.len() - 2].clone();
            self.working.get_mut(&right_id).unwrap().parent = Some(parent_id.clone());
            self.insert_into_parent(
                &parent_id,
                node_id,
                mid_value,
                right_id,
                &ancestor_path[..ancestor_path.len() - 1],
            )?;
        }
        Ok(())
    }

    pub fn delete(&mut self, key: K, value: V) -> TreeResult<()> {
        self.ensure_active()?;
        let Some(root) = self.root_id.clone() else {
            return Ok(());
        };
        let cmp = self.shared.comparator.clone();

        let mut path_ids = Vec::new();
        {
            let mut current = root;
            loop {
                self.touch(&current)?;
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
        self.fix_after_shrink(&path_ids)?;
        Ok(())
    }

    fn fix_after_shrink(&mut self, path: &[NodeId]) -> TreeResult<()> {
        let node_id = path.last().unwrap().clone();

        if path.len() == 1 {
            let is_internal = !self.working[&node_id].leaf;
            if is_internal && self.working[&node_id].keys.as_children().len() == 1 {
                let only_child = self.working[&node_id].keys.as_children()[0].clone();
                self.touch(&only_child)?;
                self.working.get_mut(&only_child).unwrap().parent = None;
                self.remove_node(&node_id);
                self.root_id = Some(only_child);
                tracing::debug!(new_root = %self.root_id.as_ref().unwrap(), "tree.collapse_root");
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
        self.touch(&left_id)?;
        self.touch(&right_id)?;

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
            self.merge_nodes(&left_id, &right_id, &parent_id, parent_sep_index, is_leaf)?;
            self.fix_after_shrink(&path[..path.len() - 1])?;
        } else {
            self.redistribute(
                &left_id,
                &right_id,
                &parent_id,
                parent_sep_index,
                is_leaf,
                deficient_is_left,
            )?;
        }
        Ok(())
    }

    fn merge_nodes(
        &mut self,
        left_id: &NodeId,
        right_id: &NodeId,
        parent_id: &NodeId,
        sep_index: usize,
        is_leaf: bool,
    ) -> TreeResult<()> {
        tracing::debug!(left = %left_id, right = %right_id, "tree.merge");
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
                self.touch(&next_id)?;
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
                self.touch(child)?;
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

    fn redistribute(
        &mut self,
        left_id: &NodeId,
        right_id: &NodeId,
        parent_id: &NodeId,
        sep_index: usize,
        is_leaf: bool,
        deficient_is_left: bool,
    ) -> TreeResult<()> {
        tracing::debug!(left = %left_id, right = %right_id, "tree.redistribute");
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
            self.touch(&first_child)?;
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
            self.touch(&last_child)?;
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

    /// Runs `f` as a nested workspace sharing this transaction's working
    /// set. A nested `init`/`clear` has no call surface to reach (those
    /// are root-only `Tree` lifecycle operations, not `Transaction`
    /// methods), satisfying spec §4.3's nested-transaction restriction by
    /// construction. On `Err`, every mutation `f` made is rolled back to
    /// the checkpoint taken before it ran; on `Ok`, the mutations simply
    /// remain, "folding into the parent" because they share one map.
    pub fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> TreeResult<T>) -> TreeResult<T> {
        self.ensure_active()?;
        let checkpoint = (
            self.working.clone(),
            self.originals.clone(),
            self.created.clone(),
            self.dirty.clone(),
            self.deleted.clone(),
            self.root_id.clone(),
        );
        match f(self) {
            Ok(v) => Ok(v),
            Err(e) => {
                (
                    self.working,
                    self.originals,
                    self.created,
                    self.dirty,
                    self.deleted,
                    self.root_id,
                ) = checkpoint;
                Err(e)
            }
        }
    }

    /// Atomic commit with optimistic conflict detection (spec §4.3
    /// "Commit protocol"). All backend writes happen here, not as the
    /// transaction runs, so a plain `rollback` never needs to undo any
    /// backend state.
    pub fn commit(mut self, cleanup: bool) -> TreeResult<CommitOutcome> {
        self.ensure_active()?;
        self.state = TxState::RolledBack; // terminated either way once we proceed past this point

        let mut id_map: HashMap<NodeId, NodeId> = HashMap::new();
        for id in &self.dirty {
            let is_leaf = self.working[id].leaf;
            let new_id = self.shared.backend.new_id(is_leaf)?;
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
            if let Err(e) = self.shared.backend.write(node) {
                for w in &written {
                    let _ = self.shared.backend.delete(w);
                }
                self.shared.watermarks.lock().remove(&self.tx_id);
                return Err(e);
            }
            written.push(node.id.clone());
        }

        let cas_ok = self.shared.backend.cas_head(
            self.initial_head_version,
            final_root,
            self.initial_head_data.clone(),
        )?;

        if !cas_ok {
            for w in &written {
                let _ = self.shared.backend.delete(w);
            }
            let observed = self
                .shared
                .backend
                .read_head()?
                .map(|h| h.version)
                .unwrap_or(self.initial_head_version);
            self.shared.watermarks.lock().remove(&self.tx_id);
            self.shared.obsolete.gc(self.shared.min_watermark());
            tracing::warn!(
                tx_id = self.tx_id,
                expected = self.initial_head_version,
                observed,
                "tx.commit_conflict"
            );
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
                let _ = self.shared.backend.delete(id);
            }
            obsolete_ids.push(id.clone());
        }

        self.shared.watermarks.lock().remove(&self.tx_id);
        self.shared.obsolete.gc(self.shared.min_watermark());

        tracing::debug!(tx_id = self.tx_id, new_version, "tx.commit");

        Ok(CommitOutcome {
            success: true,
            created: written,
            obsolete: obsolete_ids,
            error: None,
        })
    }

    pub fn rollback(mut self) -> TreeResult<CommitOutcome> {
        self.ensure_active()?;
        self.state = TxState::RolledBack;
        self.shared.watermarks.lock().remove(&self.tx_id);
        self.shared.obsolete.gc(self.shared.min_watermark());
        tracing::debug!(tx_id = self.tx_id, "tx.rollback");
        Ok(CommitOutcome {
            success: true,
            created: Vec::new(),
            obsolete: Vec::new(),
            error: None,
        })
    }
}

impl<K, V, B> Drop for Transaction<K, V, B> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            self.shared.watermarks.lock().remove(&self.tx_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use crate::comparator::NaturalComparator;
    use crate::query::LikeCache;

    fn fresh_shared(order: u32) -> Arc<Shared<i32, i32, MemoryBackend<i32, i32>>> {
        let backend: MemoryBackend<i32, i32> = MemoryBackend::new();
        let leaf_id = backend.new_id(true).unwrap();
        let leaf: Node<i32, i32> = Node::new_leaf(leaf_id.clone());
        backend.write(&leaf).unwrap();
        let mut head = Head::new(order);
        head.root = Some(leaf_id);
        backend.write_head(&head).unwrap();
        Arc::new(Shared {
            backend,
            comparator: Arc::new(NaturalComparator),
            cache: Cache::new(256),
            obsolete: ObsoleteCache::new(),
            like_cache: LikeCache::new(64),
            watermarks: parking_lot::Mutex::new(HashMap::new()),
            next_tx_id: AtomicU64::new(0),
        })
    }

    /// Walks the leaf chain from the leftmost leaf, returning every value in
    /// visitation order along with each leaf's distinct-value count (root
    /// leaf excepted from the balance check by the caller).
    fn walk_leaf_chain(
        tx: &Transaction<i32, i32, MemoryBackend<i32, i32>>,
    ) -> (Vec<i32>, Vec<usize>) {
        let mut values = Vec::new();
        let mut leaf_sizes = Vec::new();
        let mut current = tx.leftmost_leaf_id().unwrap();
        let mut prev_id: Option<NodeId> = None;
        let mut visited = HashSet::new();
        while let Some(id) = current {
            assert!(visited.insert(id.clone()), "leaf {id} visited twice");
            let leaf = tx.read_node(&id).unwrap();
            assert_eq!(leaf.prev, prev_id, "leaf {id} prev pointer mismatch");
            leaf_sizes.push(leaf.values.len());
            values.extend(leaf.values.iter().copied());
            prev_id = Some(id.clone());
            current = leaf.next.clone();
        }
        (values, leaf_sizes)
    }

    #[test]
    fn order_preservation_and_leaf_chain_well_formedness() {
        let shared = fresh_shared(4);
        let mut tx = Transaction::begin(shared).unwrap();
        // Intentionally unsorted input; only the final leaf-chain order matters.
        for v in [50, 10, 30, 5, 90, 20, 70, 60, 40, 80, 1, 99] {
            tx.insert(v, v * 10).unwrap();
        }
        let (values, leaf_sizes) = walk_leaf_chain(&tx);
        let mut sorted = values.clone();
        sorted.sort_unstable();
        assert_eq!(values, sorted, "leaf chain must be in ascending value order");

        let min_leaf = tree::min_leaf_values(tx.order());
        if leaf_sizes.len() > 1 {
            // The sole leaf may double as the root, which is exempt from
            // the minimum-occupancy bound; only check once there's more
            // than one leaf (none of which can be the root).
            for (i, size) in leaf_sizes.iter().enumerate() {
                assert!(
                    *size >= min_leaf,
                    "leaf {i} underflows minimum occupancy: {size} < {min_leaf}"
                );
            }
        }
        let _ = tx.rollback();
    }

    #[test]
    fn key_uniqueness_across_leaf_chain() {
        let shared = fresh_shared(4);
        let mut tx = Transaction::begin(shared).unwrap();
        for v in 0..40 {
            tx.insert(v, v).unwrap();
        }
        let mut current = tx.leftmost_leaf_id().unwrap();
        let mut seen_keys: HashSet<i32> = HashSet::new();
        while let Some(id) = current {
            let leaf = tx.read_node(&id).unwrap();
            for set in leaf.keys.as_leaf() {
                for k in set {
                    assert!(seen_keys.insert(*k), "key {k} appears in more than one leaf entry");
                }
            }
            current = leaf.next.clone();
        }
        assert_eq!(seen_keys.len(), 40);
        let _ = tx.rollback();
    }

    #[test]
    fn idempotent_double_insert_collapses_to_one_entry() {
        let shared = fresh_shared(4);
        let mut tx = Transaction::begin(shared).unwrap();
        tx.insert(1, 100).unwrap();
        tx.insert(1, 100).unwrap();
        assert_eq!(tx.get(&1).unwrap(), Some(100));
        tx.delete(1, 100).unwrap();
        assert_eq!(tx.get(&1).unwrap(), None, "a single delete must fully remove an idempotently-reinserted key");
        let _ = tx.rollback();
    }

    #[test]
    fn structural_integrity_through_rebalance() {
        let shared = fresh_shared(4);
        let mut tx = Transaction::begin(shared).unwrap();
        for v in 1..=60 {
            tx.insert(v, v * 100).unwrap();
        }
        for v in 1..=60 {
            tx.delete(v, v * 100).unwrap();
        }
        assert_eq!(tx.get(&1).unwrap(), None);
        // Root collapsed back to a single empty leaf; fresh inserts behave
        // exactly as they would against a brand-new tree.
        tx.insert(42, 4200).unwrap();
        assert_eq!(tx.get(&42).unwrap(), Some(4200));
        let (values, _) = walk_leaf_chain(&tx);
        assert_eq!(values, vec![42]);
        let _ = tx.rollback();
    }
}
