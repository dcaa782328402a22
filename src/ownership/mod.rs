// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Field ownership: managedFields decoding and projection

pub mod ledger;
pub mod path_set;
pub mod projector;

pub use ledger::{FieldOwnershipLedger, LedgerView};
pub use path_set::{PathElement, PathSet};
pub use projector::{FieldOwnershipProjector, ProjectionRules};
