// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Directional leaf-chain scan (spec §4.4, §4.5).
//!
//! The driver decides where the walk starts, which way it goes, and whether
//! a match-then-non-match boundary permits stopping early. Every operator
//! present in the condition, including the driver's own, is re-checked on
//! each candidate, so the result is always the full conjunction regardless
//! of which operator happened to seed the scan.

use crate::comparator::Comparator;
use crate::error::{TreeError, TreeResult};
use crate::mvcc::Transaction;
use crate::node::Node;
use crate::query::condition::{select_driver, Condition, DriverKind};
use crate::query::like::LikeCache;
use crate::tree::{self, DescendMode};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::hash::Hash;

fn start_of<K, V, B>(
    tx: &Transaction<K, V, B>,
    condition: &Condition<V>,
) -> TreeResult<(Option<Node<K, V>>, i64, i8, bool)>
where
    K: Clone + Eq + Hash + Ord,
    V: Clone,
    B: crate::backend::Backend<K, V>,
{
    let cmp = tx.comparator();

    let Some(driver) = select_driver(condition) else {
        return Err(TreeError::InvalidCondition {
            reason: "condition carries no recognisable operator".to_string(),
        });
    };

    let direction = driver.direction();
    let early_terminate = driver.early_terminate();

    let seek_leaf = |v: &V, mode: DescendMode| -> TreeResult<Option<Node<K, V>>> {
        match tx.root_id() {
            Some(root) => {
                let path = tree::descend_path(cmp, root, v, mode, &mut |id| tx.read_node(id))?;
                Ok(path.into_iter().last())
            }
            None => Ok(None),
        }
    };

    let leftmost = |tx: &Transaction<K, V, B>| -> TreeResult<(Option<Node<K, V>>, i64)> {
        let leaf = match tx.leftmost_leaf_id()? {
            Some(id) => Some(tx.read_node(&id)?),
            None => None,
        };
        Ok((leaf, 0))
    };

    match driver {
        DriverKind::Equal => {
            let v = condition.equal.as_ref().unwrap();
            let leaf = seek_leaf(v, DescendMode::Asc)?;
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
            let leaf = seek_leaf(v, DescendMode::Primary)?;
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
            let leaf = seek_leaf(v, DescendMode::Asc)?;
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
            let leaf = seek_leaf(v, DescendMode::Primary)?;
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
            let leaf = seek_leaf(v, DescendMode::Asc)?;
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
            let leaf = seek_leaf(v, DescendMode::PrimaryRightmost)?;
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
            let leaf = seek_leaf(min, DescendMode::Asc)?;
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
            let leaf = seek_leaf(min, DescendMode::Primary)?;
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
            let (leaf, idx) = leftmost(tx)?;
            Ok((leaf, idx, direction, early_terminate))
        }
    }
}

/// Lazy, restartable scan over a snapshot (spec §4.5 "Streaming"). Dropping
/// the iterator ends the scan; there is no separate cancellation token in
/// the synchronous variant.
pub struct ScanStream<'a, K, V, B> {
    tx: &'a Transaction<K, V, B>,
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

impl<'a, K, V, B> ScanStream<'a, K, V, B>
where
    K: Clone + Eq + Hash + Ord,
    V: Clone,
    B: crate::backend::Backend<K, V>,
{
    pub fn new(
        tx: &'a Transaction<K, V, B>,
        condition: Condition<V>,
        like_cache: &'a LikeCache,
        limit: Option<usize>,
    ) -> TreeResult<Self> {
        let (leaf, idx, direction, early_terminate) = start_of(tx, &condition)?;
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

    fn advance_cursor(&mut self) -> TreeResult<()> {
        self.idx += self.direction as i64;
        let Some(leaf) = &self.leaf else { return Ok(()) };
        if self.idx < 0 {
            self.leaf = match &leaf.prev {
                Some(id) => Some(self.tx.read_node(id)?),
                None => None,
            };
            if let Some(l) = &self.leaf {
                self.idx = l.values.len() as i64 - 1;
            }
        } else if self.idx as usize >= leaf.values.len() {
            self.leaf = match &leaf.next {
                Some(id) => Some(self.tx.read_node(id)?),
                None => None,
            };
            self.idx = 0;
        }
        Ok(())
    }

    fn fill_buffer(&mut self) -> TreeResult<()> {
        while self.buffer.is_empty() {
            if self.limit.map(|l| self.emitted >= l).unwrap_or(false) {
                self.leaf = None;
                return Ok(());
            }
            let Some(leaf) = self.leaf.clone() else {
                return Ok(());
            };
            if self.idx < 0 || self.idx as usize >= leaf.values.len() {
                self.advance_cursor()?;
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
            self.advance_cursor()?;
        }
        Ok(())
    }
}

impl<'a, K, V, B> Iterator for ScanStream<'a, K, V, B>
where
    K: Clone + Eq + Hash + Ord,
    V: Clone,
    B: crate::backend::Backend<K, V>,
{
    type Item = TreeResult<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if let Err(e) = self.fill_buffer() {
                return Some(Err(e));
            }
        }
        let next = self.buffer.pop_front();
        if next.is_some() {
            self.emitted += 1;
        }
        next.map(Ok)
    }
}
