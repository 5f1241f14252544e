// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the tree engine.
//!
//! Recoverable conditions (commit conflicts) are returned as values through
//! `TreeResult`; invariant violations and backend failures propagate and
//! abort the current operation.

use thiserror::Error;

/// Standard result type for all tree operations.
pub type TreeResult<T> = Result<T, TreeError>;

/// Error kinds produced by the tree engine.
#[derive(Debug, Error)]
pub enum TreeError {
    /// `order` was less than 3 at tree construction.
    #[error("invalid order {order}: B+tree order must be >= 3")]
    InvalidOrder { order: u32 },

    /// Backend `read` returned nothing for an id the tree expected.
    #[error("missing node {id}: backend has no record for an id the tree expected to exist")]
    MissingNode { id: String },

    /// A transaction attempted to read an id it has already deleted.
    #[error("transaction read node {id} after deleting it")]
    DeletedNodeRead { id: String },

    /// Head CAS lost to a concurrent commit.
    #[error("commit conflict: expected head version {expected}, observed {observed}")]
    CommitConflict { expected: u64, observed: u64 },

    /// Double init/clear, nested init/clear, or an operation on a terminated transaction.
    #[error("lifecycle violation: {reason}")]
    LifecycleViolation { reason: String },

    /// A query carried no recognisable operator.
    #[error("invalid condition: {reason}")]
    InvalidCondition { reason: String },

    /// Transparent pass-through of a storage backend failure.
    #[error("backend error during '{operation}': {source}")]
    BackendError {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl TreeError {
    /// Wraps an arbitrary backend error with the operation that triggered it.
    pub fn backend(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        TreeError::BackendError {
            operation: operation.into(),
            source: Box::new(source),
        }
    }
}
