// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! MVCC transaction layer (spec §4.3).

mod obsolete;
mod transaction;

pub use obsolete::ObsoleteCache;
pub use transaction::{CommitOutcome, Transaction, TxState};
pub(crate) use transaction::Shared;
