// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Downsync match evaluation
//!
//! A rule matches an object when every populated axis passes. An axis with an
//! empty set is not specified and never excludes; a `"*"` member matches any
//! value. The namespace axes only apply to namespaced objects.

use kube::core::{Selector, SelectorExt};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

use super::SelectionRule;
use super::selector;
use crate::error::Result;

const WILDCARD: &str = "*";

/// The object attributes a rule is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub group: &'a str,
    /// Plural resource name
    pub resource: &'a str,
    /// None for cluster-scoped objects
    pub namespace: Option<&'a str>,
    pub name: &'a str,
    pub labels: &'a BTreeMap<String, String>,
}

/// A set of names where an empty set means "no restriction"
#[derive(Debug, Clone, Default)]
struct NameSet {
    names: HashSet<String>,
    wildcard: bool,
}

impl NameSet {
    fn new(names: &[String]) -> Self {
        Self {
            wildcard: names.iter().any(|n| n == WILDCARD),
            names: names.iter().cloned().collect(),
        }
    }

    fn admits(&self, value: &str) -> bool {
        self.names.is_empty() || self.wildcard || self.names.contains(value)
    }
}

/// A selection rule with its selectors parsed
#[derive(Debug, Clone)]
pub struct CompiledRule {
    api_group: Option<String>,
    resources: NameSet,
    namespaces: NameSet,
    namespace_selectors: Vec<Selector>,
    object_names: NameSet,
    object_selectors: Vec<Selector>,
}

impl CompiledRule {
    pub fn compile(rule: &SelectionRule) -> Result<Self> {
        let namespace_selectors = rule
            .namespace_selectors
            .iter()
            .map(selector::compile)
            .collect::<Result<Vec<_>>>()?;
        let object_selectors = rule
            .object_selectors
            .iter()
            .map(selector::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            api_group: rule.api_group.clone(),
            resources: NameSet::new(&rule.resources),
            namespaces: NameSet::new(&rule.namespaces),
            namespace_selectors,
            object_names: NameSet::new(&rule.object_names),
            object_selectors,
        })
    }

    /// Whether namespace label changes can affect this rule
    pub fn uses_namespace_selectors(&self) -> bool {
        !self.namespace_selectors.is_empty()
    }

    /// Whether any object of this collection could match, judged on the
    /// type axes alone
    pub fn may_select(&self, group: &str, resource: &str) -> bool {
        self.api_group.as_deref().is_none_or(|g| g == group) && self.resources.admits(resource)
    }
}

/// Compile a policy's rules. A rule that fails to compile is skipped and
/// reported; the remaining rules are still used.
pub fn compile_rules(policy: &str, rules: &[SelectionRule]) -> (Vec<CompiledRule>, Vec<String>) {
    let mut compiled = Vec::with_capacity(rules.len());
    let mut errors = Vec::new();
    for (idx, rule) in rules.iter().enumerate() {
        match CompiledRule::compile(rule) {
            Ok(rule) => compiled.push(rule),
            Err(e) => {
                warn!(policy = %policy, rule = idx, error = %e, "Skipping invalid downsync rule");
                errors.push(format!("downsync[{}]: {}", idx, e));
            }
        }
    }
    (compiled, errors)
}

fn any_selector_matches(selectors: &[Selector], labels: &BTreeMap<String, String>) -> bool {
    selectors.is_empty() || selectors.iter().any(|s| s.matches(labels))
}

/// Evaluate one rule. `namespace_labels` are the labels of the object's
/// namespace; when they are unknown the namespace is treated as unlabelled.
pub fn matches(
    rule: &CompiledRule,
    obj: &Candidate<'_>,
    namespace_labels: Option<&BTreeMap<String, String>>,
) -> bool {
    if let Some(group) = &rule.api_group
        && group != obj.group
    {
        return false;
    }
    if !rule.resources.admits(obj.resource) {
        return false;
    }
    if let Some(namespace) = obj.namespace {
        if !rule.namespaces.admits(namespace) {
            return false;
        }
        if !rule.namespace_selectors.is_empty() {
            let empty = BTreeMap::new();
            let ns_labels = namespace_labels.unwrap_or(&empty);
            if !any_selector_matches(&rule.namespace_selectors, ns_labels) {
                return false;
            }
        }
    }
    if !rule.object_names.admits(obj.name) {
        return false;
    }
    any_selector_matches(&rule.object_selectors, obj.labels)
}

/// A policy selects an object when any of its rules matches
pub fn matches_any(
    rules: &[CompiledRule],
    obj: &Candidate<'_>,
    namespace_labels: Option<&BTreeMap<String, String>>,
) -> bool {
    rules.iter().any(|rule| matches(rule, obj, namespace_labels))
}
