// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Trie of field paths decoded from the `FieldsV1` managed-fields format
//!
//! `FieldsV1` is a nested JSON object whose keys are path elements:
//! - `f:<name>` a map field
//! - `k:<json object>` a list element identified by its key fields
//! - `v:<json value>` a set element identified by its value
//! - `i:<n>` a list element identified by position
//! - `.` the enclosing path itself is owned
//!
//! An element mapping to `{}` is an owned leaf.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One step in a field path. JSON payloads are stored in canonical (sorted,
/// compact) form so they can be compared and ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathElement {
    Field(String),
    Key(Vec<(String, String)>),
    Value(String),
    Index(usize),
}

impl PathElement {
    pub fn field(name: &str) -> Self {
        PathElement::Field(name.to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let (prefix, rest) = raw
            .split_once(':')
            .ok_or_else(|| format!("path element '{}' has no prefix", raw))?;
        match prefix {
            "f" => Ok(PathElement::Field(rest.to_string())),
            "k" => {
                let keys: Map<String, Value> = serde_json::from_str(rest)
                    .map_err(|e| format!("bad key element '{}': {}", raw, e))?;
                if keys.is_empty() {
                    return Err(format!("empty key element '{}'", raw));
                }
                Ok(PathElement::Key(
                    keys.into_iter().map(|(k, v)| (k, v.to_string())).collect(),
                ))
            }
            "v" => {
                let value: Value = serde_json::from_str(rest)
                    .map_err(|e| format!("bad value element '{}': {}", raw, e))?;
                Ok(PathElement::Value(value.to_string()))
            }
            "i" => rest
                .parse()
                .map(PathElement::Index)
                .map_err(|_| format!("bad index element '{}'", raw)),
            _ => Err(format!("unknown path element prefix in '{}'", raw)),
        }
    }
}

/// Set of owned paths below some prefix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathSet {
    /// The prefix itself is owned
    member: bool,
    children: BTreeMap<PathElement, PathSet>,
}

static EMPTY: PathSet = PathSet {
    member: false,
    children: BTreeMap::new(),
};

impl PathSet {
    /// Decode a `FieldsV1` document
    pub fn from_fields_v1(value: &Value) -> Result<Self, String> {
        let Value::Object(map) = value else {
            return Err(format!("expected object, found {}", value));
        };

        let mut set = PathSet {
            member: map.is_empty(),
            children: BTreeMap::new(),
        };
        for (raw, child) in map {
            if raw == "." {
                set.member = true;
                continue;
            }
            let element = PathElement::parse(raw)?;
            set.children.insert(element, PathSet::from_fields_v1(child)?);
        }
        Ok(set)
    }

    /// Restrict to the paths under one element
    pub fn step_into(&self, element: &PathElement) -> &PathSet {
        self.children.get(element).unwrap_or(&EMPTY)
    }

    /// Restrict to the paths under a list item, matched by key fields, then
    /// by value, then by position. Nothing matching means nothing is owned.
    pub fn step_into_item(&self, index: usize, item: &Value) -> &PathSet {
        if let Value::Object(fields) = item {
            let keyed = self.children.iter().find(|(element, _)| match element {
                PathElement::Key(keys) => keys
                    .iter()
                    .all(|(k, v)| fields.get(k).is_some_and(|f| f.to_string() == *v)),
                _ => false,
            });
            if let Some((_, set)) = keyed {
                return set;
            }
        }
        if let Some(set) = self.children.get(&PathElement::Value(item.to_string())) {
            return set;
        }
        self.step_into(&PathElement::Index(index))
    }

    pub fn is_empty(&self) -> bool {
        !self.member && self.children.values().all(PathSet::is_empty)
    }

    /// The prefix is owned as a whole, with nothing listed below it
    pub fn is_leaf(&self) -> bool {
        self.member && self.children.is_empty()
    }

    pub fn is_member(&self) -> bool {
        self.member
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_elements() {
        assert_eq!(PathElement::parse("f:spec").unwrap(), PathElement::field("spec"));
        assert_eq!(PathElement::parse("i:3").unwrap(), PathElement::Index(3));
        assert_eq!(
            PathElement::parse(r#"v:"x""#).unwrap(),
            PathElement::Value(r#""x""#.to_string())
        );
        assert_eq!(
            PathElement::parse(r#"k:{"port":80,"protocol":"TCP"}"#).unwrap(),
            PathElement::Key(vec![
                ("port".to_string(), "80".to_string()),
                ("protocol".to_string(), r#""TCP""#.to_string()),
            ])
        );
        // Field names may contain colons
        assert_eq!(
            PathElement::parse("f:a:b").unwrap(),
            PathElement::field("a:b")
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(PathElement::parse("spec").is_err());
        assert!(PathElement::parse("x:spec").is_err());
        assert!(PathElement::parse("i:-1").is_err());
        assert!(PathElement::parse("k:{}").is_err());
        assert!(PathElement::parse("k:not json").is_err());
        assert!(PathSet::from_fields_v1(&json!(["f:spec"])).is_err());
    }

    #[test]
    fn test_step_into() {
        let set = PathSet::from_fields_v1(&json!({
            "f:spec": {
                ".": {},
                "f:replicas": {},
            }
        }))
        .unwrap();
        let spec = set.step_into(&PathElement::field("spec"));
        assert!(spec.is_member());
        assert!(!spec.is_leaf());
        assert!(spec.step_into(&PathElement::field("replicas")).is_leaf());
        assert!(spec.step_into(&PathElement::field("paused")).is_empty());
        assert!(set.step_into(&PathElement::field("status")).is_empty());
    }

    #[test]
    fn test_step_into_item_by_key_value_and_index() {
        let set = PathSet::from_fields_v1(&json!({
            r#"k:{"name":"web"}"#: {"f:image": {}},
            r#"v:"finalizer-a""#: {},
            "i:5": {},
        }))
        .unwrap();

        // Keyed element found regardless of position
        let web = set.step_into_item(9, &json!({"name": "web", "image": "nginx"}));
        assert!(web.step_into(&PathElement::field("image")).is_leaf());

        assert!(set.step_into_item(0, &json!("finalizer-a")).is_leaf());
        assert!(set.step_into_item(0, &json!("finalizer-b")).is_empty());

        // Positional fallback
        assert!(set.step_into_item(5, &json!({"other": 1})).is_leaf());
        assert!(set.step_into_item(4, &json!({"other": 1})).is_empty());
    }
}
