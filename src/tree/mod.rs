// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Pure B+tree arithmetic and position-finding helpers (spec §4.2).
//!
//! Everything here is a free function over already-fetched node contents:
//! no backend I/O, no locking. This is the seam shared by the synchronous
//! and asynchronous transaction layers (spec §5): both fetch nodes their
//! own way and then call into this module to decide what to do with them.

use crate::comparator::Comparator;
use std::cmp::Ordering;

/// `mid = ceil(order/2) - 1`: leaf split point (spec §4.2 "Leaf insert").
pub fn leaf_split_mid(order: u32) -> usize {
    (ceil_div(order, 2) - 1) as usize
}

/// `ceil(order/2)`: number of children the left half keeps after an
/// internal-node split (spec §4.2 "Parent insert").
pub fn internal_split_left_count(order: u32) -> usize {
    ceil_div(order, 2) as usize
}

/// Minimum children an internal node must hold (root excepted).
pub fn min_children(order: u32) -> usize {
    ceil_div(order, 2) as usize
}

/// Minimum distinct values a leaf must hold (root excepted).
pub fn min_leaf_values(order: u32) -> usize {
    ceil_div(order - 1, 2) as usize
}

fn ceil_div(n: u32, d: u32) -> u32 {
    (n + d - 1) / d
}

/// Descends one level: given an internal node's separators and the query
/// value, returns the index of the child to follow.
///
/// Scans left to right: equal to `values[i]` descends right (`i+1`);
/// strictly less than `values[i]` descends left (`i`); otherwise continues.
/// Falling off the end takes the rightmost child.
pub fn child_index<V>(cmp: &dyn Comparator<V>, values: &[V], needle: &V) -> usize {
    for (i, s) in values.iter().enumerate() {
        match cmp.asc(needle, s) {
            Ordering::Equal => return i + 1,
            Ordering::Less => return i,
            Ordering::Greater => continue,
        }
    }
    values.len()
}

/// Primary-comparator variant of [`child_index`], used for range seeks over
/// composite values sharing a primary group. Equal-by-primary descends
/// left, matching `insertable_by_primary`.
pub fn child_index_by_primary<V>(cmp: &dyn Comparator<V>, values: &[V], needle: &V) -> usize {
    for (i, s) in values.iter().enumerate() {
        match cmp.primary_asc(needle, s) {
            Ordering::Equal | Ordering::Less => return i,
            Ordering::Greater => continue,
        }
    }
    values.len()
}

/// Rightmost-descent primary variant: equal-by-primary keeps descending
/// right, used to seek the last leaf that could hold a given primary group
/// (`insertable_rightmost_by_primary`).
pub fn child_index_rightmost_by_primary<V>(
    cmp: &dyn Comparator<V>,
    values: &[V],
    needle: &V,
) -> usize {
    for (i, s) in values.iter().enumerate() {
        match cmp.primary_asc(needle, s) {
            Ordering::Equal | Ordering::Greater => continue,
            Ordering::Less => return i,
        }
    }
    values.len()
}

/// Locates `needle` in an ascending-by-`asc` slice of leaf values.
///
/// `Ok(i)` means `values[i]` equals `needle`; `Err(i)` is the sorted
/// insertion point.
pub fn leaf_position<V>(cmp: &dyn Comparator<V>, values: &[V], needle: &V) -> Result<usize, usize> {
    let mut lo = 0usize;
    let mut hi = values.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match cmp.asc(&values[mid], needle) {
            Ordering::Equal => return Ok(mid),
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
        }
    }
    Err(lo)
}

/// Which descent rule to apply at each internal node (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescendMode {
    /// Plain `asc`-ordered descent (used by point inserts/deletes/gets).
    Asc,
    /// `insertable_by_primary`: equal-by-primary descends left.
    Primary,
    /// `insertable_rightmost_by_primary`: equal-by-primary descends right.
    PrimaryRightmost,
}

/// Walks from `root` to the leaf that would hold `target`, returning the
/// full path (root first, leaf last). `fetch` is the only I/O performed;
/// it may return a read-only clone or a copy-on-write clone depending on
/// the caller (insert/delete CoW-clone each node on the path, plain reads
/// and scans do not).
pub fn descend_path<K, V>(
    cmp: &dyn Comparator<V>,
    root: crate::node::NodeId,
    target: &V,
    mode: DescendMode,
    fetch: &mut dyn FnMut(&crate::node::NodeId) -> crate::error::TreeResult<crate::node::Node<K, V>>,
) -> crate::error::TreeResult<Vec<crate::node::Node<K, V>>> {
    let mut path = Vec::new();
    let mut current_id = root;
    loop {
        let node = fetch(&current_id)?;
        let is_leaf = node.leaf;
        let next_id = if is_leaf {
            path.push(node);
            break;
        } else {
            let idx = match mode {
                DescendMode::Asc => child_index(cmp, &node.values, target),
                DescendMode::Primary => child_index_by_primary(cmp, &node.values, target),
                DescendMode::PrimaryRightmost => {
                    child_index_rightmost_by_primary(cmp, &node.values, target)
                }
            };
            let child = node.keys.as_children()[idx].clone();
            path.push(node);
            child
        };
        current_id = next_id;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::NaturalComparator;

    #[test]
    fn leaf_split_mid_matches_spec_formula() {
        assert_eq!(leaf_split_mid(4), 1); // ceil(4/2)-1 = 1
        assert_eq!(leaf_split_mid(5), 1); // ceil(5/2)-1 = 2-1=1
        assert_eq!(leaf_split_mid(6), 2);
    }

    #[test]
    fn child_index_equal_descends_right() {
        let cmp = NaturalComparator;
        let values = vec![10, 20, 30];
        assert_eq!(child_index(&cmp, &values, &20), 2);
        assert_eq!(child_index(&cmp, &values, &15), 1);
        assert_eq!(child_index(&cmp, &values, &5), 0);
        assert_eq!(child_index(&cmp, &values, &100), 3);
    }

    #[test]
    fn leaf_position_finds_exact_and_insertion_point() {
        let cmp = NaturalComparator;
        let values = vec![10, 20, 30];
        assert_eq!(leaf_position(&cmp, &values, &20), Ok(1));
        assert_eq!(leaf_position(&cmp, &values, &15), Err(1));
        assert_eq!(leaf_position(&cmp, &values, &100), Err(3));
    }

    #[test]
    fn min_bounds_match_spec_examples() {
        assert_eq!(min_children(4), 2);
        assert_eq!(min_leaf_values(4), 2); // ceil(3/2)=2
        assert_eq!(min_leaf_values(5), 2); // ceil(4/2)=2
    }
}
