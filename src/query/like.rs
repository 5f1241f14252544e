// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! `like` pattern compilation with a bounded memoisation cache (spec §9
//! "Pattern cache").
//!
//! `%` matches any run of characters, `_` matches exactly one; both compile
//! to a regex-equivalent matcher so hot loops don't recompile per call.

use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;

fn compile(pattern: &str) -> Regex {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).expect("escaped like-pattern always compiles")
}

/// Bounded LRU-ish cache of compiled `like` patterns, shared by one engine
/// instance.
pub struct LikeCache {
    capacity: usize,
    entries: Mutex<HashMap<String, Regex>>,
}

impl LikeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn matches(&self, pattern: &str, candidate: &str) -> bool {
        let mut entries = self.entries.lock();
        if let Some(re) = entries.get(pattern) {
            return re.is_match(candidate);
        }
        let re = compile(pattern);
        let matched = re.is_match(candidate);
        if entries.len() >= self.capacity {
            // No access-order tracking here: a full cache just stops memoising
            // new patterns rather than evicting a possibly-hot one.
        } else {
            entries.insert(pattern.to_string(), re);
        }
        matched
    }
}

impl Default for LikeCache {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_matches_any_run() {
        let cache = LikeCache::default();
        assert!(cache.matches("ap%", "apple"));
        assert!(cache.matches("ap%", "apricot"));
        assert!(!cache.matches("ap%", "banana"));
    }

    #[test]
    fn underscore_matches_one_char() {
        let cache = LikeCache::default();
        assert!(cache.matches("b_t", "bat"));
        assert!(!cache.matches("b_t", "boat"));
    }

    #[test]
    fn suffix_pattern() {
        let cache = LikeCache::default();
        assert!(cache.matches("% Doe", "John Doe"));
        assert!(!cache.matches("% Doe", "John Smith"));
    }

    #[test]
    fn literal_chars_are_escaped() {
        let cache = LikeCache::default();
        assert!(cache.matches("a.b", "a.b"));
        assert!(!cache.matches("a.b", "axb"));
    }
}
