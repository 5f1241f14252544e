// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Public facade (spec §6 "Public API surface").
//!
//! `Tree` wires the comparator, backend, node cache, obsolete cache, and
//! pattern cache into one engine instance and exposes the lifecycle and
//! auto-transaction convenience methods. Most callers only ever touch this
//! module and [`crate::mvcc::Transaction`].

use crate::backend::Backend;
use crate::cache::Cache;
use crate::comparator::Comparator;
use crate::error::{TreeError, TreeResult};
use crate::mvcc::obsolete::ObsoleteCache;
use crate::mvcc::{CommitOutcome, Transaction};
use crate::node::{Head, Node};
use crate::query::{Condition, LikeCache};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Construction-time configuration (spec §2 item 10 "Configuration").
pub struct TreeConfig {
    pub order: u32,
    pub initial_head_data: serde_json::Map<String, serde_json::Value>,
    pub cache_capacity: usize,
    pub like_cache_capacity: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            order: 64,
            initial_head_data: serde_json::Map::new(),
            cache_capacity: 4096,
            like_cache_capacity: 256,
        }
    }
}

impl TreeConfig {
    pub fn new(order: u32) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }
}

/// A candidate `{tree, condition}` pair for [`Tree::choose_driver`].
pub struct DriverCandidate<'a, K, V, B> {
    pub tree: &'a Tree<K, V, B>,
    pub condition: Condition<V>,
}

/// An embeddable, order-configurable B+tree engine instance.
pub struct Tree<K, V, B> {
    shared: Arc<crate::mvcc::Shared<K, V, B>>,
    initialized: AtomicBool,
}

impl<K, V, B> Tree<K, V, B>
where
    K: Clone + Eq + Hash + Ord + Send + Sync,
    V: Clone + Send + Sync,
    B: Backend<K, V>,
{
    pub fn new(backend: B, comparator: Arc<dyn Comparator<V>>, config: TreeConfig) -> Self {
        let shared = crate::mvcc::Shared {
            backend,
            comparator,
            cache: Cache::new(config.cache_capacity),
            obsolete: ObsoleteCache::new(),
            like_cache: LikeCache::new(config.like_cache_capacity),
            watermarks: parking_lot::Mutex::new(HashMap::new()),
            next_tx_id: AtomicU64::new(0),
        };
        Self {
            shared: Arc::new(shared),
            initialized: AtomicBool::new(false),
        }
    }

    /// Loads an existing head or bootstraps an empty tree with a single
    /// empty leaf as root (spec §3 "Lifecycles", §6). Idempotent on a
    /// freshly constructed engine; rejected afterwards.
    pub fn init(&self, order: u32, initial_head_data: serde_json::Map<String, serde_json::Value>) -> TreeResult<()> {
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
        if self.shared.backend.read_head()?.is_none() {
            let leaf_id = self.shared.backend.new_id(true)?;
            let leaf: Node<K, V> = Node::new_leaf(leaf_id.clone());
            self.shared.backend.write(&leaf)?;
            let mut head = Head::new(order);
            head.root = Some(leaf_id);
            head.data = initial_head_data;
            self.shared.backend.write_head(&head)?;
            tracing::debug!(order, "tree.init_bootstrap");
        }
        Ok(())
    }

    pub fn create_transaction(&self) -> TreeResult<Transaction<K, V, B>> {
        Transaction::begin(self.shared.clone())
    }

    pub fn get_head_data(&self) -> TreeResult<serde_json::Map<String, serde_json::Value>> {
        let head = self
            .shared
            .backend
            .read_head()?
            .ok_or_else(|| TreeError::LifecycleViolation {
                reason: "tree has not been initialised".to_string(),
            })?;
        Ok(head.data)
    }

    /// Updates the caller's opaque metadata via its own CAS retry loop. This
    /// shares the head's version counter with transaction commits, so a
    /// racing commit and a racing `set_head_data` each see the other as a
    /// conflict — a deliberate simplification (single shared version
    /// counter, per spec §3) rather than a finer-grained scheme.
    pub fn set_head_data(
        &self,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> TreeResult<()> {
        loop {
            let head = self
                .shared
                .backend
                .read_head()?
                .ok_or_else(|| TreeError::LifecycleViolation {
                    reason: "tree has not been initialised".to_string(),
                })?;
            if self
                .shared
                .backend
                .cas_head(head.version, head.root, data.clone())?
            {
                return Ok(());
            }
        }
    }

    /// Flushes the node cache; if `id` is given only that entry is dropped.
    /// Returns the number of entries purged.
    pub fn force_update(&self, id: Option<&crate::node::NodeId>) -> usize {
        match id {
            Some(id) => {
                self.shared.cache.invalidate(id);
                1
            }
            None => self.shared.cache.clear(),
        }
    }

    fn auto_commit<T>(
        &self,
        f: impl FnOnce(&mut Transaction<K, V, B>) -> TreeResult<T>,
    ) -> TreeResult<T> {
        let mut tx = self.create_transaction()?;
        let result = f(&mut tx)?;
        let outcome = tx.commit(true)?;
        if !outcome.success {
            return Err(TreeError::CommitConflict {
                expected: 0,
                observed: 0,
            });
        }
        Ok(result)
    }

    pub fn insert(&self, key: K, value: V) -> TreeResult<()> {
        self.auto_commit(|tx| tx.insert(key, value))
    }

    pub fn delete(&self, key: K, value: V) -> TreeResult<()> {
        self.auto_commit(|tx| tx.delete(key, value))
    }

    pub fn get(&self, key: &K) -> TreeResult<Option<V>> {
        let tx = self.create_transaction()?;
        let result = tx.get(key);
        let _ = tx.rollback();
        result
    }

    pub fn exists(&self, key: &K, value: &V) -> TreeResult<bool> {
        let tx = self.create_transaction()?;
        let result = tx.exists(key, value);
        let _ = tx.rollback();
        result
    }

    pub fn where_(&self, condition: Condition<V>, limit: Option<usize>) -> TreeResult<HashMap<K, V>> {
        let tx = self.create_transaction()?;
        let result = tx.where_(condition, limit);
        let _ = tx.rollback();
        result
    }

    pub fn keys(&self, condition: Condition<V>, limit: Option<usize>) -> TreeResult<HashSet<K>> {
        let tx = self.create_transaction()?;
        let result = tx.keys::<fn(&K, &V) -> bool>(condition, None, limit);
        let _ = tx.rollback();
        result
    }

    /// Commits `outcome`'s bookkeeping away and surfaces a conflict as an
    /// error, matching "each creates a single-op transaction, commits, and
    /// surfaces commit failure as an error" (spec §6).
    pub fn commit_outcome_to_result(outcome: CommitOutcome) -> TreeResult<CommitOutcome> {
        if outcome.success {
            Ok(outcome)
        } else {
            Err(TreeError::CommitConflict {
                expected: 0,
                observed: 0,
            })
        }
    }
}

/// Cross-tree driver selection (spec §4.4 "ChooseDriver"): among several
/// `{tree, condition}` candidates, picks the one whose own driver would
/// outrank the others'.
pub fn choose_driver<'a, K, V, B>(
    candidates: Vec<DriverCandidate<'a, K, V, B>>,
) -> Option<DriverCandidate<'a, K, V, B>> {
    candidates
        .into_iter()
        .filter_map(|c| crate::query::select_driver(&c.condition).map(|d| (d, c)))
        .max_by_key(|(d, _)| (d.priority(), u8::MAX - d.tie_break_rank()))
        .map(|(_, c)| c)
}
