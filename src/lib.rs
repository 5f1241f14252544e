// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! An embeddable, order-configurable B+tree with MVCC snapshot-isolated
//! transactions.
//!
//! Values drive the tree's order; keys are the payload a query returns.
//! Duplicate values coalesce into one leaf entry holding a set of keys. A
//! [`Tree`] couples a caller-supplied [`Comparator`] and [`Backend`] with an
//! in-process node cache and obsolete-node cache; [`mvcc::Transaction`] is
//! the unit of snapshot isolation and copy-on-write mutation.
//!
//! ```no_run
//! use mvbtree::{Tree, TreeConfig, NaturalComparator, MemoryBackend};
//! use std::sync::Arc;
//!
//! let tree: Tree<String, i32, _> = Tree::new(
//!     MemoryBackend::new(),
//!     Arc::new(NaturalComparator),
//!     TreeConfig::new(64),
//! );
//! tree.init(64, Default::default()).unwrap();
//! tree.insert("a".to_string(), 1).unwrap();
//! assert_eq!(tree.get(&"a".to_string()).unwrap(), Some(1));
//! ```

pub mod backend;
pub mod cache;
pub mod comparator;
pub mod error;
pub mod facade;
pub mod mvcc;
pub mod node;
pub mod query;
pub mod tree;

#[cfg(feature = "async")]
pub mod asynchronous;

pub use backend::{Backend, MemoryBackend};
pub use comparator::{Comparator, NaturalComparator};
pub use error::{TreeError, TreeResult};
pub use facade::{choose_driver, DriverCandidate, Tree, TreeConfig};
pub use mvcc::{CommitOutcome, Transaction, TxState};
pub use node::{Head, Node, NodeId};
pub use query::{Condition, DriverKind};

#[cfg(feature = "async")]
pub use asynchronous::{AsyncTransaction, AsyncTree};
