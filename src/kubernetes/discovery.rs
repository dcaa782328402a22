// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Resource catalogue for the source cluster.
//!
//! Discovery is a full read: every snapshot replaces the previous one
//! wholesale. A snapshot may be incomplete when some API groups could not be
//! listed (typically an unavailable aggregated API); that condition is
//! recoverable and the failed groups are recorded on the snapshot.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;

use super::{Gvk, Gvr};
use crate::error::Result;

/// API groups that are never watched
pub const EXCLUDED_GROUPS: &[&str] = &[
    "apiregistration.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "events.k8s.io",
    "flowcontrol.apiserver.k8s.io",
    "internal.apiserver.k8s.io",
    "authentication.k8s.io",
    "authorization.k8s.io",
    crate::policy::GROUP,
];

/// Resources (by plural name) that are never watched, whatever their group
pub const EXCLUDED_RESOURCES: &[&str] = &[
    "events",
    "endpoints",
    "endpointslices",
    "apiservices",
    "controllerrevisions",
    "leases",
    "bindings",
    "componentstatuses",
    "flowschemas",
    "prioritylevelconfigurations",
    "tokenreviews",
    "selfsubjectaccessreviews",
    "selfsubjectrulesreviews",
    "subjectaccessreviews",
    "localsubjectaccessreviews",
];

/// One discoverable resource type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogueEntry {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name (e.g. "configmaps")
    pub resource: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
}

impl CatalogueEntry {
    pub fn gvk(&self) -> Gvk {
        Gvk::new(&self.group, &self.version, &self.kind)
    }

    pub fn gvr(&self) -> Gvr {
        Gvr::new(&self.group, &self.version, &self.resource)
    }

    /// Whether a list-then-watch subscription can be opened for this type
    pub fn is_watchable(&self) -> bool {
        self.verbs.iter().any(|v| v == "list") && self.verbs.iter().any(|v| v == "watch")
    }

    /// Get the full API group/version string
    pub fn api_version(&self) -> String {
        self.gvk().api_version()
    }
}

/// Result of one discovery pass
#[derive(Debug, Clone, Default)]
pub struct DiscoverySnapshot {
    pub entries: Vec<CatalogueEntry>,
    /// API groups that could not be listed in this pass
    pub failed_groups: Vec<String>,
}

impl DiscoverySnapshot {
    pub fn complete(entries: Vec<CatalogueEntry>) -> Self {
        Self {
            entries,
            failed_groups: Vec::new(),
        }
    }

    /// True when the API server could not return the complete list
    pub fn is_incomplete(&self) -> bool {
        !self.failed_groups.is_empty()
    }
}

/// The discovery boundary
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Read the full set of resource types. An error means nothing usable was
    /// returned; partial results are reported through the snapshot instead.
    async fn discover(&self) -> Result<DiscoverySnapshot>;
}

/// Decides which catalogue entries may be watched
#[derive(Debug, Clone)]
pub struct ResourceFilter {
    excluded_groups: HashSet<String>,
    excluded_resources: HashSet<String>,
    /// Empty means every group is allowed
    allowed_groups: HashSet<String>,
}

impl Default for ResourceFilter {
    fn default() -> Self {
        Self::new(&[], &[], &[])
    }
}

impl ResourceFilter {
    /// Build a filter from the built-in exclusions plus extra ones
    pub fn new(
        allowed_groups: &[String],
        extra_excluded_groups: &[String],
        extra_excluded_resources: &[String],
    ) -> Self {
        let excluded_groups = EXCLUDED_GROUPS
            .iter()
            .map(|g| g.to_string())
            .chain(extra_excluded_groups.iter().cloned())
            .collect();
        let excluded_resources = EXCLUDED_RESOURCES
            .iter()
            .map(|r| r.to_string())
            .chain(extra_excluded_resources.iter().cloned())
            .collect();
        Self {
            excluded_groups,
            excluded_resources,
            allowed_groups: allowed_groups.iter().cloned().collect(),
        }
    }

    pub fn is_group_allowed(&self, group: &str) -> bool {
        self.allowed_groups.is_empty() || self.allowed_groups.contains(group)
    }

    /// Check exclusion lists, the allow-list and the list+watch verbs.
    /// Namespaces bypass the allow-list: namespace selectors read their labels.
    pub fn allows(&self, entry: &CatalogueEntry) -> bool {
        !self.excluded_groups.contains(&entry.group)
            && !self.excluded_resources.contains(&entry.resource)
            && (self.is_group_allowed(&entry.group) || entry.gvk() == Gvk::namespace())
            && entry.is_watchable()
    }

    /// The allowed entries of a snapshot, in discovery order
    pub fn allowed<'a>(&self, snapshot: &'a DiscoverySnapshot) -> Vec<&'a CatalogueEntry> {
        snapshot.entries.iter().filter(|e| self.allows(e)).collect()
    }
}
