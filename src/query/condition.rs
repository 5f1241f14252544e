// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Condition taxonomy and driver selection (spec §4.4).
//!
//! A `Condition` is a conjunction (AND) of whichever operator fields are
//! set; `or`/`primary_or` express disjunction within their own dimension.
//! Exactly one present operator is promoted to *driver* and seeds the scan;
//! every operator, including the driver's own, is re-checked as a
//! post-filter so the result is always the full conjunction.

use crate::comparator::Comparator;
use crate::query::like::LikeCache;

/// A compound predicate over value type `V` (spec §4.4 "Condition taxonomy").
#[derive(Debug, Clone, Default)]
pub struct Condition<V> {
    pub equal: Option<V>,
    pub not_equal: Option<V>,
    pub gt: Option<V>,
    pub gte: Option<V>,
    pub lt: Option<V>,
    pub lte: Option<V>,
    pub or: Option<Vec<V>>,
    pub like: Option<String>,
    pub primary_equal: Option<V>,
    pub primary_not_equal: Option<V>,
    pub primary_gt: Option<V>,
    pub primary_gte: Option<V>,
    pub primary_lt: Option<V>,
    pub primary_lte: Option<V>,
    pub primary_or: Option<Vec<V>>,
}

impl<V> Condition<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equal(mut self, v: V) -> Self {
        self.equal = Some(v);
        self
    }
    pub fn not_equal(mut self, v: V) -> Self {
        self.not_equal = Some(v);
        self
    }
    pub fn gt(mut self, v: V) -> Self {
        self.gt = Some(v);
        self
    }
    pub fn gte(mut self, v: V) -> Self {
        self.gte = Some(v);
        self
    }
    pub fn lt(mut self, v: V) -> Self {
        self.lt = Some(v);
        self
    }
    pub fn lte(mut self, v: V) -> Self {
        self.lte = Some(v);
        self
    }
    pub fn or(mut self, vs: Vec<V>) -> Self {
        self.or = Some(vs);
        self
    }
    pub fn like(mut self, pattern: impl Into<String>) -> Self {
        self.like = Some(pattern.into());
        self
    }
    pub fn primary_equal(mut self, v: V) -> Self {
        self.primary_equal = Some(v);
        self
    }
    pub fn primary_not_equal(mut self, v: V) -> Self {
        self.primary_not_equal = Some(v);
        self
    }
    pub fn primary_gt(mut self, v: V) -> Self {
        self.primary_gt = Some(v);
        self
    }
    pub fn primary_gte(mut self, v: V) -> Self {
        self.primary_gte = Some(v);
        self
    }
    pub fn primary_lt(mut self, v: V) -> Self {
        self.primary_lt = Some(v);
        self
    }
    pub fn primary_lte(mut self, v: V) -> Self {
        self.primary_lte = Some(v);
        self
    }
    pub fn primary_or(mut self, vs: Vec<V>) -> Self {
        self.primary_or = Some(vs);
        self
    }

    fn is_empty(&self) -> bool {
        self.equal.is_none()
            && self.not_equal.is_none()
            && self.gt.is_none()
            && self.gte.is_none()
            && self.lt.is_none()
            && self.lte.is_none()
            && self.or.is_none()
            && self.like.is_none()
            && self.primary_equal.is_none()
            && self.primary_not_equal.is_none()
            && self.primary_gt.is_none()
            && self.primary_gte.is_none()
            && self.primary_lt.is_none()
            && self.primary_lte.is_none()
            && self.primary_or.is_none()
    }

    /// Every present operator must pass for `value` to be a match.
    pub fn matches(&self, cmp: &dyn Comparator<V>, like_cache: &LikeCache, value: &V) -> bool {
        if let Some(v) = &self.equal {
            if !cmp.is_same(value, v) {
                return false;
            }
        }
        if let Some(v) = &self.not_equal {
            if cmp.is_same(value, v) {
                return false;
            }
        }
        if let Some(v) = &self.gt {
            if !cmp.is_higher(value, v) {
                return false;
            }
        }
        if let Some(v) = &self.gte {
            if cmp.is_lower(value, v) {
                return false;
            }
        }
        if let Some(v) = &self.lt {
            if !cmp.is_lower(value, v) {
                return false;
            }
        }
        if let Some(v) = &self.lte {
            if cmp.is_higher(value, v) {
                return false;
            }
        }
        if let Some(vs) = &self.or {
            if !vs.iter().any(|v| cmp.is_same(value, v)) {
                return false;
            }
        }
        if let Some(pattern) = &self.like {
            if !like_cache.matches(pattern, &cmp.pattern_match(value)) {
                return false;
            }
        }
        if let Some(v) = &self.primary_equal {
            if !cmp.primary_is_same(value, v) {
                return false;
            }
        }
        if let Some(v) = &self.primary_not_equal {
            if cmp.primary_is_same(value, v) {
                return false;
            }
        }
        if let Some(v) = &self.primary_gt {
            if cmp.primary_asc(value, v) != std::cmp::Ordering::Greater {
                return false;
            }
        }
        if let Some(v) = &self.primary_gte {
            if cmp.primary_asc(value, v) == std::cmp::Ordering::Less {
                return false;
            }
        }
        if let Some(v) = &self.primary_lt {
            if cmp.primary_asc(value, v) != std::cmp::Ordering::Less {
                return false;
            }
        }
        if let Some(v) = &self.primary_lte {
            if cmp.primary_asc(value, v) == std::cmp::Ordering::Greater {
                return false;
            }
        }
        if let Some(vs) = &self.primary_or {
            if !vs.iter().any(|v| cmp.primary_is_same(value, v)) {
                return false;
            }
        }
        true
    }
}

/// The operator promoted to seed a scan (spec §4.4 "Driver selection").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Equal,
    PrimaryEqual,
    Or,
    PrimaryOr,
    Gt,
    Gte,
    Lt,
    Lte,
    PrimaryGt,
    PrimaryGte,
    PrimaryLt,
    PrimaryLte,
    Like,
    NotEqual,
    PrimaryNotEqual,
}

impl DriverKind {
    pub(crate) fn priority(self) -> u8 {
        use DriverKind::*;
        match self {
            Equal | PrimaryEqual => 100,
            Or | PrimaryOr => 80,
            Gt | Gte | Lt | Lte | PrimaryGt | PrimaryGte | PrimaryLt | PrimaryLte => 50,
            Like => 30,
            NotEqual | PrimaryNotEqual => 10,
        }
    }

    /// Fixed operator-name order used to break priority ties deterministically.
    pub(crate) fn tie_break_rank(self) -> u8 {
        use DriverKind::*;
        match self {
            Equal => 0,
            PrimaryEqual => 1,
            Or => 2,
            PrimaryOr => 3,
            Gt => 4,
            Gte => 5,
            Lt => 6,
            Lte => 7,
            PrimaryGt => 8,
            PrimaryGte => 9,
            PrimaryLt => 10,
            PrimaryLte => 11,
            Like => 12,
            NotEqual => 13,
            PrimaryNotEqual => 14,
        }
    }

    /// Scan direction this driver seeds: `+1` ascending, `-1` descending.
    pub fn direction(self) -> i8 {
        use DriverKind::*;
        match self {
            Lt | Lte | PrimaryLt | PrimaryLte => -1,
            _ => 1,
        }
    }

    /// Whether a match-then-non-match boundary permits stopping the scan.
    pub fn early_terminate(self) -> bool {
        matches!(self, DriverKind::Equal | DriverKind::PrimaryEqual)
    }

    pub fn uses_primary_comparator(self) -> bool {
        use DriverKind::*;
        matches!(
            self,
            PrimaryEqual
                | PrimaryOr
                | PrimaryGt
                | PrimaryGte
                | PrimaryLt
                | PrimaryLte
                | PrimaryNotEqual
        )
    }
}

/// Picks the highest-priority operator present in `condition`, breaking ties
/// by the fixed order in [`DriverKind::tie_break_rank`]. Returns `None` if no
/// operator is set.
pub fn select_driver<V>(condition: &Condition<V>) -> Option<DriverKind> {
    if condition.is_empty() {
        return None;
    }
    let mut candidates = Vec::new();
    if condition.equal.is_some() {
        candidates.push(DriverKind::Equal);
    }
    if condition.primary_equal.is_some() {
        candidates.push(DriverKind::PrimaryEqual);
    }
    if condition.or.is_some() {
        candidates.push(DriverKind::Or);
    }
    if condition.primary_or.is_some() {
        candidates.push(DriverKind::PrimaryOr);
    }
    if condition.gt.is_some() {
        candidates.push(DriverKind::Gt);
    }
    if condition.gte.is_some() {
        candidates.push(DriverKind::Gte);
    }
    if condition.lt.is_some() {
        candidates.push(DriverKind::Lt);
    }
    if condition.lte.is_some() {
        candidates.push(DriverKind::Lte);
    }
    if condition.primary_gt.is_some() {
        candidates.push(DriverKind::PrimaryGt);
    }
    if condition.primary_gte.is_some() {
        candidates.push(DriverKind::PrimaryGte);
    }
    if condition.primary_lt.is_some() {
        candidates.push(DriverKind::PrimaryLt);
    }
    if condition.primary_lte.is_some() {
        candidates.push(DriverKind::PrimaryLte);
    }
    if condition.like.is_some() {
        candidates.push(DriverKind::Like);
    }
    if condition.not_equal.is_some() {
        candidates.push(DriverKind::NotEqual);
    }
    if condition.primary_not_equal.is_some() {
        candidates.push(DriverKind::PrimaryNotEqual);
    }

    candidates
        .into_iter()
        .max_by_key(|d| (d.priority(), u8::MAX - d.tie_break_rank()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_outranks_range_and_like() {
        let cond = Condition::<i32>::new().gt(1).like("a%");
        assert_eq!(select_driver(&cond), Some(DriverKind::Like));
        let cond = cond.equal(5);
        assert_eq!(select_driver(&cond), Some(DriverKind::Equal));
    }

    #[test]
    fn or_outranks_range() {
        let cond = Condition::<i32>::new().gt(1).or(vec![1, 2]);
        assert_eq!(select_driver(&cond), Some(DriverKind::Or));
    }

    #[test]
    fn empty_condition_has_no_driver() {
        assert_eq!(select_driver(&Condition::<i32>::new()), None);
    }
}
