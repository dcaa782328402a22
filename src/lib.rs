// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! kubedownsync: selects objects from a source cluster by policy and
//! delivers their user-owned content to destination clusters.
//!
//! Resource types are discovered at runtime and watched dynamically. Each
//! BindingPolicy is evaluated against the watched objects into a Binding,
//! and each Binding is resolved, projected down to the fields owned by the
//! configured managers, wrapped and delivered.

pub mod binding;
pub mod cli;
pub mod config;
pub mod error;
pub mod kubernetes;
pub mod output;
pub mod ownership;
pub mod policy;
pub mod progress;
pub mod transport;
pub mod workqueue;

pub use error::{Error, ErrorClass, Result};
