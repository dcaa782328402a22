// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Label selector validation and compilation

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::Selector;
use regex::Regex;
use std::sync::LazyLock;

use crate::error::{Error, Result};

/// Name part of a qualified key, also the shape of a non-empty label value
static NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").unwrap()
});

/// DNS-1123 subdomain, used as the optional key prefix
static PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

fn validate_key(key: &str) -> Result<()> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix
        && (prefix.len() > MAX_PREFIX_LEN || !PREFIX.is_match(prefix))
    {
        return Err(Error::InvalidSelector(format!("invalid key prefix in '{}'", key)));
    }
    if name.len() > MAX_NAME_LEN || !NAME.is_match(name) {
        return Err(Error::InvalidSelector(format!("invalid key '{}'", key)));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > MAX_NAME_LEN || !NAME.is_match(value) {
        return Err(Error::InvalidSelector(format!(
            "invalid value '{}' for key '{}'",
            value, key
        )));
    }
    Ok(())
}

/// Check a selector against the label syntax rules
pub fn validate(selector: &LabelSelector) -> Result<()> {
    for (key, value) in selector.match_labels.iter().flatten() {
        validate_key(key)?;
        validate_value(key, value)?;
    }

    for expr in selector.match_expressions.iter().flatten() {
        validate_key(&expr.key)?;
        let values = expr.values.as_deref().unwrap_or_default();
        match expr.operator.as_str() {
            "In" | "NotIn" => {
                if values.is_empty() {
                    return Err(Error::InvalidSelector(format!(
                        "operator {} on '{}' requires values",
                        expr.operator, expr.key
                    )));
                }
                for value in values {
                    validate_value(&expr.key, value)?;
                }
            }
            "Exists" | "DoesNotExist" => {
                if !values.is_empty() {
                    return Err(Error::InvalidSelector(format!(
                        "operator {} on '{}' must not have values",
                        expr.operator, expr.key
                    )));
                }
            }
            other => {
                return Err(Error::InvalidSelector(format!(
                    "unknown operator '{}' on '{}'",
                    other, expr.key
                )));
            }
        }
    }
    Ok(())
}

/// Validate and convert to an evaluable selector
pub fn compile(selector: &LabelSelector) -> Result<Selector> {
    validate(selector)?;
    Selector::try_from(selector.clone()).map_err(|e| Error::InvalidSelector(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use kube::core::SelectorExt;
    use std::collections::BTreeMap;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn expr(key: &str, op: &str, values: Option<&[&str]>) -> LabelSelector {
        LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: key.to_string(),
                operator: op.to_string(),
                values: values.map(|v| v.iter().map(|s| s.to_string()).collect()),
            }]),
        }
    }

    #[test]
    fn test_match_labels() {
        let sel = compile(&LabelSelector {
            match_labels: Some(labels(&[("app", "web")])),
            match_expressions: None,
        })
        .unwrap();
        assert!(sel.matches(&labels(&[("app", "web"), ("tier", "fe")])));
        assert!(!sel.matches(&labels(&[("app", "db")])));
        assert!(!sel.matches(&labels(&[])));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let sel = compile(&LabelSelector::default()).unwrap();
        assert!(sel.matches(&labels(&[])));
        assert!(sel.matches(&labels(&[("a", "b")])));
    }

    #[test]
    fn test_expressions() {
        let sel = compile(&expr("env", "In", Some(&["prod", "staging"]))).unwrap();
        assert!(sel.matches(&labels(&[("env", "prod")])));
        assert!(!sel.matches(&labels(&[("env", "dev")])));

        let sel = compile(&expr("env", "DoesNotExist", None)).unwrap();
        assert!(sel.matches(&labels(&[])));
        assert!(!sel.matches(&labels(&[("env", "dev")])));
    }

    #[test]
    fn test_invalid_selectors() {
        assert!(compile(&expr("env", "In", None)).is_err());
        assert!(compile(&expr("env", "In", Some(&[]))).is_err());
        assert!(compile(&expr("env", "Exists", Some(&["x"]))).is_err());
        assert!(compile(&expr("env", "Near", Some(&["x"]))).is_err());
        assert!(compile(&expr("-bad", "Exists", None)).is_err());
        assert!(compile(&expr("Bad_Prefix/key", "Exists", None)).is_err());

        let bad_value = LabelSelector {
            match_labels: Some(labels(&[("app", "has space")])),
            match_expressions: None,
        };
        assert!(matches!(compile(&bad_value), Err(Error::InvalidSelector(_))));
    }

    #[test]
    fn test_prefixed_keys() {
        assert!(compile(&expr("app.kubernetes.io/name", "Exists", None)).is_ok());
        assert!(validate_key("example.com/").is_err());
        assert!(validate_key(&"a".repeat(64)).is_err());
    }
}
