// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Trims an object to the fields owned by a set of manager identities.
//!
//! Only the configured scopes of a document are trimmed (by default `spec`);
//! everything outside them is carried as-is. Inside a scope, a map key or list
//! item with no owned path below it is dropped, and a path owned as a whole is
//! kept whole.

use kube::api::DynamicObject;
use serde_json::Value;
use std::collections::HashMap;
use tracing::trace;

use super::ledger::{FieldOwnershipLedger, LedgerView};
use super::path_set::PathElement;
use crate::error::Result;

/// Field paths trimmed for each kind, looked up by (group, kind)
#[derive(Debug, Clone)]
pub struct ProjectionRules {
    default_scopes: Vec<Vec<String>>,
    overrides: HashMap<(String, String), Vec<Vec<String>>>,
}

fn path(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}

impl Default for ProjectionRules {
    fn default() -> Self {
        let mut overrides = HashMap::new();
        overrides.insert(
            ("batch".to_string(), "Job".to_string()),
            vec![
                path(&["spec", "selector"]),
                path(&["spec", "template", "metadata", "labels"]),
            ],
        );
        // Carried verbatim
        overrides.insert((String::new(), "ConfigMap".to_string()), Vec::new());
        overrides.insert((String::new(), "Secret".to_string()), Vec::new());

        Self {
            default_scopes: vec![path(&["spec"])],
            overrides,
        }
    }
}

impl ProjectionRules {
    pub fn scopes_for(&self, group: &str, kind: &str) -> &[Vec<String>] {
        self.overrides
            .get(&(group.to_string(), kind.to_string()))
            .unwrap_or(&self.default_scopes)
    }

    pub fn with_override(mut self, group: &str, kind: &str, scopes: Vec<Vec<String>>) -> Self {
        self.overrides
            .insert((group.to_string(), kind.to_string()), scopes);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FieldOwnershipProjector {
    managers: Vec<String>,
    subresource: String,
    rules: ProjectionRules,
}

impl FieldOwnershipProjector {
    /// Projector for the main resource (no subresource)
    pub fn new(managers: Vec<String>) -> Self {
        Self {
            managers,
            subresource: String::new(),
            rules: ProjectionRules::default(),
        }
    }

    pub fn with_rules(mut self, rules: ProjectionRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn managers(&self) -> &[String] {
        &self.managers
    }

    /// Serialize `obj` and trim its scoped fields to what the managers own.
    ///
    /// Missing or malformed ownership metadata is an error for this object
    /// only, unless its kind has no scopes to trim.
    pub fn project(&self, obj: &DynamicObject) -> Result<Value> {
        let (group, kind) = match &obj.types {
            Some(types) => (
                types
                    .api_version
                    .rsplit_once('/')
                    .map(|(g, _)| g)
                    .unwrap_or_default(),
                types.kind.as_str(),
            ),
            None => ("", ""),
        };
        let scopes = self.rules.scopes_for(group, kind);

        let mut doc = serde_json::to_value(obj)?;
        if scopes.is_empty() {
            return Ok(doc);
        }

        let ledger = FieldOwnershipLedger::from_object(obj, &self.subresource)?;
        let view = ledger.view_for(&self.managers);
        for scope in scopes {
            trim_scope(&mut doc, scope, &view);
        }
        trace!(group = %group, kind = %kind, "Projected object");
        Ok(doc)
    }
}

/// Trim the value at `scope`, removing it if nothing below it is owned
fn trim_scope(doc: &mut Value, scope: &[String], view: &LedgerView<'_>) {
    let Some((last, parents)) = scope.split_last() else {
        return;
    };

    let mut parent = doc;
    for field in parents {
        parent = match parent.get_mut(field.as_str()) {
            Some(next) => next,
            None => return,
        };
    }
    let Value::Object(map) = parent else {
        return;
    };

    let scoped = view.advance(scope);
    if scoped.is_empty() {
        map.remove(last);
    } else if let Some(value) = map.get_mut(last) {
        trim(value, &scoped);
    }
}

fn trim(value: &mut Value, view: &LedgerView<'_>) {
    if view.is_leaf() {
        return;
    }
    match value {
        Value::Object(map) => {
            map.retain(|key, child| {
                let child_view = view.step(&PathElement::field(key));
                if child_view.is_empty() {
                    return false;
                }
                trim(child, &child_view);
                true
            });
        }
        Value::Array(items) => {
            let mut index = 0;
            items.retain_mut(|item| {
                let item_view = view.step_item(index, item);
                index += 1;
                if item_view.is_empty() {
                    return false;
                }
                trim(item, &item_view);
                true
            });
        }
        _ => {}
    }
}
