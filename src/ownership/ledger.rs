// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ManagedFieldsEntry;
use kube::api::DynamicObject;
use serde_json::Value;

use super::path_set::{PathElement, PathSet};
use crate::error::{Error, Result};

/// One manager's owned fields
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub manager: String,
    pub operation: Option<String>,
    pub fields: PathSet,
}

/// Point-in-time field ownership of one object, for one subresource.
/// Rebuilt from the object's managedFields on every projection.
#[derive(Debug, Clone)]
pub struct FieldOwnershipLedger {
    entries: Vec<LedgerEntry>,
}

impl FieldOwnershipLedger {
    pub fn from_object(obj: &DynamicObject, subresource: &str) -> Result<Self> {
        let object = describe(obj);
        let managed = obj
            .metadata
            .managed_fields
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| Error::MissingOwnership {
                object: object.clone(),
            })?;
        Self::from_managed_fields(&object, managed, subresource)
    }

    pub fn from_managed_fields(
        object: &str,
        managed: &[ManagedFieldsEntry],
        subresource: &str,
    ) -> Result<Self> {
        let malformed = |reason: String| Error::MalformedOwnership {
            object: object.to_string(),
            reason,
        };

        let mut entries = Vec::new();
        for mfe in managed {
            if mfe.subresource.as_deref().unwrap_or_default() != subresource {
                continue;
            }
            let manager = mfe.manager.clone().unwrap_or_default();
            if mfe.fields_type.as_deref() != Some("FieldsV1") {
                return Err(malformed(format!(
                    "manager '{}' has fieldsType {:?}",
                    manager, mfe.fields_type
                )));
            }
            let raw: &Value = match &mfe.fields_v1 {
                Some(fields) => &fields.0,
                None => return Err(malformed(format!("manager '{}' has no fieldsV1", manager))),
            };
            let fields = PathSet::from_fields_v1(raw)
                .map_err(|e| malformed(format!("manager '{}': {}", manager, e)))?;
            entries.push(LedgerEntry {
                manager,
                operation: mfe.operation.clone(),
                fields,
            });
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Combined view over the given managers' fields. An empty manager list
    /// selects every manager.
    pub fn view_for(&self, managers: &[String]) -> LedgerView<'_> {
        LedgerView {
            sets: self
                .entries
                .iter()
                .filter(|e| managers.is_empty() || managers.contains(&e.manager))
                .map(|e| &e.fields)
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

fn describe(obj: &DynamicObject) -> String {
    let name = obj.metadata.name.as_deref().unwrap_or_default();
    match obj.metadata.namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

/// Union of several managers' path sets, narrowed together
#[derive(Debug, Clone, Default)]
pub struct LedgerView<'a> {
    sets: Vec<&'a PathSet>,
}

impl<'a> LedgerView<'a> {
    pub fn step(&self, element: &PathElement) -> LedgerView<'a> {
        LedgerView {
            sets: self
                .sets
                .iter()
                .copied()
                .map(|s| s.step_into(element))
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn step_item(&self, index: usize, item: &Value) -> LedgerView<'a> {
        LedgerView {
            sets: self
                .sets
                .iter()
                .copied()
                .map(|s| s.step_into_item(index, item))
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Step through a sequence of map fields
    pub fn advance<S: AsRef<str>>(&self, fields: &[S]) -> LedgerView<'a> {
        fields.iter().fold(self.clone(), |view, field| {
            view.step(&PathElement::field(field.as_ref()))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Some manager owns this path as a whole
    pub fn is_leaf(&self) -> bool {
        self.sets.iter().any(|s| s.is_leaf())
    }
}
