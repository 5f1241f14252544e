// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Query planner and scan generators (spec §4.4, §4.5).

mod condition;
mod like;
mod scan;

pub use condition::{select_driver, Condition, DriverKind};
pub use like::LikeCache;
pub use scan::ScanStream;
