// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Async mirror of [`crate::query::scan`] (spec §4.4, §4.5).
//!
//! Same driver-selection and post-filter logic as the synchronous
//! `ScanStream`; the only difference is that every leaf fetch suspends.
//! There is no `Stream`/`AsyncIterator` trait impl here: callers drive the
//! scan with an explicit `async fn next()`, which is all "async sequences
//! with the same semantics" (spec §4.5) requires.

use crate::asynchronous::AsyncTransaction;
use crate::backend::asynchronous::AsyncBackend;
use crate::comparator::Comparator;
use crate::error::{TreeError, TreeResult};
use crate::node::Node;
use crate::query::{select_driver, Condition, DriverKind, LikeCache};
use crate::tree::{self, DescendMode};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::hash::Hash;

async fn seek_leaf<K, V, B>(
    tx: &AsyncTransaction<K, V, B>,
    v: &V,
    mode: DescendMode,
) -> TreeResult<Option<Node<K, V>>>
where
    K: Clone + Eq + Hash + Ord + Send + Sync,
    V: Clone + Send + Sync,
    B: AsyncBackend<K, V>,
{
    let Some(root) = tx.root_id() else {
        return Ok(None);
    };
    let cmp = tx.comparator();
    let mut current = root;
    loop {
        let node = tx.read_node(&current).await?;
        if node.leaf {
            return Ok(Some(node));
        }
        let idx = match mode {
            DescendMode::Asc => tree::child_index(cmp, &node.values, v),
            DescendMode::Primary => tree::child_index_by_primary(cmp, &node.values, v),
            DescendMode::PrimaryRightmost => {
                tree::child_index_rightmost_by_primary(cmp, &node.values, v)
            }
        };
        current = node.keys.as_children()[idx].clone();
    }
}

async fn leftmost<K, V, B>(tx: &AsyncTransaction<K, V, B>) -> TreeResult<(Option<Node<K, V>>, i64)>
where
    K: Clone + Eq + Hash + Ord + Send + Sync,
    V: Clone + Send + Sync,
    B: AsyncBackend<K, V>,
{
    let leaf = match tx.leftmost_leaf_id().await? {
        Some(id) => Some(tx.read_node(&id).await?),
        None => None,
    };
    Ok((leaf, 0))
}

async fn start_of<K, V, B>(
    tx: &AsyncTransaction<K, V, B>,
    condition: &Condition<V>,
) -> TreeResult<(Option<Node<K, V>>, i64, i8, bool)>
where
    K: Clone + Eq + Hash + Ord + Send + Sync,
    V: Clone + Send + Sync,
    B: AsyncBackend<K, V>,
{
    let cmp = tx.comparator();

    let Some(driver) = select_driver(condition) else {
        return Err(TreeError::InvalidCondition {
            reason: "condition carries no recognisable operator".to_string(),
        });
    };

    let direction = driver.direction();
    let early_terminate = driver.early_terminate();

    match driver {
        DriverKind::Equal => {
            let v = condition.equal.as_ref().unwrap();
            let leaf = seek_leaf(tx, v, DescendMode::Asc).await?;
            let idx = leaf
                .as_ref()
                .map(|l| match tree::leaf_position(cmp, &l.values, v) {
                    Ok(i) | Err(i) => i as i64,
                })
                .unwrap_or(0);
            Ok((leaf, idx, direction, early_terminate))
        }
        DriverKind::PrimaryEqual => {
            let v = condition.primary_equal.as_ref().unwrap();
            let leaf = seek_leaf(tx, v, DescendMode::Primary).await?;
            let idx = leaf
                .as_ref()
                .map(|l| {
                    l.values
                        .iter()
                        .position(|x| cmp.primary_asc(x, v) != Ordering::Less)
                        .unwrap_or(l.values.len()) as i64
                })
                .unwrap_or(0);
            Ok((leaf, idx, direction, early_terminate))
        }
        DriverKind::Gt | DriverKind::Gte => {
            let v = if driver == DriverKind::Gt {
                condition.gt.as_ref().unwrap()
            } else {
                condition.gte.as_ref().unwrap()
            };
            let leaf = seek_leaf(tx, v, DescendMode::Asc).await?;
            let idx = leaf
                .as_ref()
                .map(|l| match tree::leaf_position(cmp, &l.values, v) {
                    Ok(i) => {
                        if driver == DriverKind::Gt {
                            i as i64 + 1
                        } else {
                            i as i64
                        }
                    }
                    Err(i) => i as i64,
                })
                .unwrap_or(0);
            Ok((leaf, idx, direction, early_terminate))
        }
        DriverKind::PrimaryGt | DriverKind::PrimaryGte => {
            let v = if driver == DriverKind::PrimaryGt {
                condition.primary_gt.as_ref().unwrap()
            } else {
                condition.primary_gte.as_ref().unwrap()
            };
            let leaf = seek_leaf(tx, v, DescendMode::Primary).await?;
            let idx = leaf
                .as_ref()
                .map(|l| {
                    l.values
                        .iter()
                        .position(|x| {
                            if driver == DriverKind::PrimaryGt {
                                cmp.primary_asc(x, v) == Ordering::Greater
                            } else {
                                cmp.primary_asc(x, v) != Ordering::Less
                            }
                        })
                        .unwrap_or(l.values.len()) as i64
                })
                .unwrap_or(0);
            Ok((leaf, idx, direction, early_terminate))
        }
        DriverKind::Lt | DriverKind::Lte => {
            let v = if driver == DriverKind::Lt {
                condition.lt.as_ref().unwrap()
            } else {
                condition.lte.as_ref().unwrap()
            };
            let leaf = seek_leaf(tx, v, DescendMode::Asc).await?;
            let idx = leaf
                .as_ref()
                .map(|l| match tree::leaf_position(cmp, &l.values, v) {
                    Ok(i) => {
                        if driver == DriverKind::Lt {
                            i as i64 - 1
                        } else {
                            i as i64
                        }
                    }
                    Err(i) => i as i64 - 1,
                })
                .unwrap_or(-1);
            Ok((leaf, idx, direction, early_terminate))
        }
        DriverKind::PrimaryLt | DriverKind::PrimaryLte => {
            let v = if driver == DriverKind::PrimaryLt {
                condition.primary_lt.as_ref().unwrap()
            } else {
                condition.primary_lte.as_ref().unwrap()
            };
            let leaf = seek_leaf(tx, v, DescendMode::PrimaryRightmost).await?;
            let idx = leaf
                .as_ref()
                .map(|l| {
                    l.values
                        .iter()
                        .rposition(|x| {
                            if driver == DriverKind::PrimaryLt {
                                cmp.primary_asc(x, v) == Ordering::Less
                            } else {
                                cmp.primary_asc(x, v) != Ordering::Greater
                            }
                        })
                        .map(|i| i as i64)
                        .unwrap_or(-1)
                })
                .unwrap_or(-1);
            Ok((leaf, idx, direction, early_terminate))
        }
        DriverKind::Or => {
            let vs = condition.or.as_ref().unwrap();
            let min = vs
                .iter()
                .min_by(|a, b| cmp.asc(a, b))
                .expect("or list is non-empty");
            let leaf = seek_leaf(tx, min, DescendMode::Asc).await?;
            let idx = leaf
                .as_ref()
                .map(|l| match tree::leaf_position(cmp, &l.values, min) {
                    Ok(i) | Err(i) => i as i64,
                })
                .unwrap_or(0);
            Ok((leaf, idx, direction, early_terminate))
        }
        DriverKind::PrimaryOr => {
            let vs = condition.primary_or.as_ref().unwrap();
            let min = vs
                .iter()
                .min_by(|a, b| cmp.primary_asc(a, b))
                .expect("primary_or list is non-empty");
            let leaf = seek_leaf(tx, min, DescendMode::Primary).await?;
            let idx = leaf
                .as_ref()
                .map(|l| {
                    l.values
                        .iter()
                        .position(|x| cmp.primary_asc(x, min) != Ordering::Less)
                        .unwrap_or(l.values.len()) as i64
                })
                .unwrap_or(0);
            Ok((leaf, idx, direction, early_terminate))
        }
        DriverKind::Like | DriverKind::NotEqual | DriverKind::PrimaryNotEqual => {
            let (leaf, idx) = leftmost(tx).await?;
            Ok((leaf, idx, direction, early_terminate))
        }
    }
}

/// Async counterpart of [`crate::query::ScanStream`]. No `Stream` impl;
/// drive it with [`Self::next`] (spec §4.5 "asynchronous variant... async
/// sequences with the same semantics"). Dropping it ends the scan.
pub struct AsyncScanStream<'a, K, V, B> {
    tx: &'a AsyncTransaction<K, V, B>,
    condition: Condition<V>,
    like_cache: &'a LikeCache,
    direction: i8,
    early_terminate: bool,
    matched_any: bool,
    leaf: Option<Node<K, V>>,
    idx: i64,
    buffer: VecDeque<(K, V)>,
    limit: Option<usize>,
    emitted: usize,
}

impl<'a, K, V, B> AsyncScanStream<'a, K, V, B>
where
    K: Clone + Eq + Hash + Ord + Send + Sync,
    V: Clone + Send + Sync,
    B: AsyncBackend<K, V>,
{
    pub async fn new(
        tx: &'a AsyncTransaction<K, V, B>,
        condition: Condition<V>,
        like_cache: &'a LikeCache,
        limit: Option<usize>,
    ) -> TreeResult<Self> {
        let (leaf, idx, direction, early_terminate) = start_of(tx, &condition).await?;
        Ok(Self {
            tx,
            condition,
            like_cache,
            direction,
            early_terminate,
            matched_any: false,
            leaf,
            idx,
            buffer: VecDeque::new(),
            limit,
            emitted: 0,
        })
    }

    async fn advance_cursor(&mut self) -> TreeResult<()> {
        self.idx += self.direction as i64;
        let Some(leaf) = &self.leaf else { return Ok(()) };
        if self.idx < 0 {
            self.leaf = match &leaf.prev {
                Some(id) => Some(self.tx.read_node(id).await?),
                None => None,
            };
            if let Some(l) = &self.leaf {
                self.idx = l.values.len() as i64 - 1;
            }
        } else if self.idx as usize >= leaf.values.len() {
            self.leaf = match &leaf.next {
                Some(id) => Some(self.tx.read_node(id).await?),
                None => None,
            };
            self.idx = 0;
        }
        Ok(())
    }

    async fn fill_buffer(&mut self) -> TreeResult<()> {
        while self.buffer.is_empty() {
            if self.limit.map(|l| self.emitted >= l).unwrap_or(false) {
                self.leaf = None;
                return Ok(());
            }
            let Some(leaf) = self.leaf.clone() else {
                return Ok(());
            };
            if self.idx < 0 || self.idx as usize >= leaf.values.len() {
                self.advance_cursor().await?;
                continue;
            }
            let i = self.idx as usize;
            let value = &leaf.values[i];
            let is_match = self
                .condition
                .matches(self.tx.comparator(), self.like_cache, value);
            if is_match {
                self.matched_any = true;
                for key in leaf.keys.as_leaf()[i].iter() {
                    self.buffer.push_back((key.clone(), value.clone()));
                }
            } else if self.matched_any && self.early_terminate {
                self.leaf = None;
                return Ok(());
            }
            self.advance_cursor().await?;
        }
        Ok(())
    }

    /// Yields the next `(key, value)` pair, or `None` once the scan is
    /// exhausted. Cancellation is cooperative: simply stop calling `next`.
    pub async fn next(&mut self) -> TreeResult<Option<(K, V)>> {
        if self.buffer.is_empty() {
            self.fill_buffer().await?;
        }
        let next = self.buffer.pop_front();
        if next.is_some() {
            self.emitted += 1;
        }
        Ok(next)
    }
}
