// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Value comparator capability.
//!
//! The tree never compares values itself; ordering and pattern matching are
//! supplied by the caller through this trait. `asc` must be a strict total
//! order. `primary_asc`, when provided, must be a total preorder consistent
//! with `asc`: if `primary_asc(a, b) == Equal` then `asc(a, b)` may still be
//! non-zero, but the reverse never holds for values sharing a primary group.

use std::cmp::Ordering;

/// Capability over a value type `V` providing ordering and pattern matching.
pub trait Comparator<V>: Send + Sync {
    /// Strict total order over values.
    fn asc(&self, a: &V, b: &V) -> Ordering;

    /// Projection to a string for `like` pattern matching.
    fn pattern_match(&self, v: &V) -> String;

    /// Coarser-than-`asc` preorder used by the `primary*` condition family.
    ///
    /// Defaults to `asc` when the caller has no composite-key grouping to
    /// express.
    fn primary_asc(&self, a: &V, b: &V) -> Ordering {
        self.asc(a, b)
    }

    fn is_lower(&self, a: &V, b: &V) -> bool {
        self.asc(a, b) == Ordering::Less
    }

    fn is_same(&self, a: &V, b: &V) -> bool {
        self.asc(a, b) == Ordering::Equal
    }

    fn is_higher(&self, a: &V, b: &V) -> bool {
        self.asc(a, b) == Ordering::Greater
    }

    fn primary_is_same(&self, a: &V, b: &V) -> bool {
        self.primary_asc(a, b) == Ordering::Equal
    }
}

/// Convenience comparator for value types that already implement `Ord` and
/// `ToString`, with no composite primary grouping.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalComparator;

impl<V> Comparator<V> for NaturalComparator
where
    V: Ord + ToString,
{
    fn asc(&self, a: &V, b: &V) -> Ordering {
        a.cmp(b)
    }

    fn pattern_match(&self, v: &V) -> String {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_comparator_orders_integers() {
        let cmp = NaturalComparator;
        assert!(Comparator::<i32>::is_lower(&cmp, &1, &2));
        assert!(Comparator::<i32>::is_same(&cmp, &2, &2));
        assert!(Comparator::<i32>::is_higher(&cmp, &3, &2));
    }

    #[test]
    fn default_primary_asc_matches_asc() {
        let cmp = NaturalComparator;
        assert_eq!(
            Comparator::<i32>::primary_asc(&cmp, &5, &7),
            Comparator::<i32>::asc(&cmp, &5, &7)
        );
    }
}
