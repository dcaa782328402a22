// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Policy API types: BindingPolicy (authored) and Binding (derived)

pub mod matcher;
pub mod selector;

pub use matcher::{Candidate, CompiledRule, compile_rules, matches, matches_any};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::kubernetes::Gvr;

/// API group of the control plane's own resources
pub const GROUP: &str = "control.kubedownsync.io";
pub const VERSION: &str = "v1alpha1";

/// One downsync test. Each non-empty field restricts the match; all
/// populated fields must pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespace_selectors: Vec<LabelSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object_selectors: Vec<LabelSelector>,
}

/// Selects objects in the source cluster for delivery to destinations
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "control.kubedownsync.io",
    version = "v1alpha1",
    kind = "BindingPolicy",
    plural = "bindingpolicies",
    status = "BindingPolicyStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct BindingPolicySpec {
    #[serde(default)]
    pub downsync: Vec<SelectionRule>,
    /// Destination cluster names
    #[serde(default)]
    pub destinations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingPolicyStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub matched_objects: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// What one policy currently selects. Named after, and owned by, its policy.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "control.kubedownsync.io",
    version = "v1alpha1",
    kind = "Binding",
    plural = "bindings",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct BindingSpec {
    #[serde(default)]
    pub workload: DownsyncWorkload,
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownsyncWorkload {
    #[serde(default)]
    pub cluster_scope: Vec<ClusterScopeResource>,
    #[serde(default)]
    pub namespace_scope: Vec<NamespaceScopeResource>,
}

impl DownsyncWorkload {
    /// Number of object references
    pub fn len(&self) -> usize {
        let cluster: usize = self.cluster_scope.iter().map(|r| r.object_names.len()).sum();
        let namespaced: usize = self
            .namespace_scope
            .iter()
            .flat_map(|r| r.objects_by_namespace.iter())
            .map(|o| o.names.len())
            .sum();
        cluster + namespaced
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterScopeResource {
    #[serde(flatten)]
    pub gvr: Gvr,
    #[serde(default)]
    pub object_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceScopeResource {
    #[serde(flatten)]
    pub gvr: Gvr,
    #[serde(default)]
    pub objects_by_namespace: Vec<NamespaceObjects>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceObjects {
    pub namespace: String,
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub cluster_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_deserializes_from_yaml() {
        let yaml = r#"
apiVersion: control.kubedownsync.io/v1alpha1
kind: BindingPolicy
metadata:
  name: web
spec:
  destinations: [edge-1, edge-2]
  downsync:
  - resources: [configmaps]
    namespaces: [ns1]
  - apiGroup: apps
    objectSelectors:
    - matchLabels:
        app: web
"#;
        let policy: BindingPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.spec.destinations, vec!["edge-1", "edge-2"]);
        assert_eq!(policy.spec.downsync.len(), 2);
        assert_eq!(policy.spec.downsync[0].resources, vec!["configmaps"]);
        assert_eq!(policy.spec.downsync[1].api_group.as_deref(), Some("apps"));
        assert_eq!(policy.spec.downsync[1].object_selectors.len(), 1);
    }

    #[test]
    fn test_binding_wire_shape() {
        let spec = BindingSpec {
            workload: DownsyncWorkload {
                cluster_scope: vec![ClusterScopeResource {
                    gvr: Gvr::new("", "v1", "namespaces"),
                    object_names: vec!["ns1".into()],
                }],
                namespace_scope: vec![NamespaceScopeResource {
                    gvr: Gvr::new("apps", "v1", "deployments"),
                    objects_by_namespace: vec![NamespaceObjects {
                        namespace: "ns1".into(),
                        names: vec!["web".into()],
                    }],
                }],
            },
            destinations: vec![Destination {
                cluster_id: "edge-1".into(),
            }],
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["workload"]["clusterScope"][0]["resource"], "namespaces");
        assert_eq!(value["workload"]["clusterScope"][0]["group"], "");
        assert_eq!(
            value["workload"]["namespaceScope"][0]["objectsByNamespace"][0]["names"][0],
            "web"
        );
        assert_eq!(value["destinations"][0]["clusterId"], "edge-1");
        assert_eq!(spec.workload.len(), 2);
    }
}
