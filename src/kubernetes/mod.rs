mod client;
pub mod discovery;
pub mod watch;

pub use client::{ApiResolver, ClusterClient, KubeDiscovery, KubeWatchSource, watch_crd_changes};
pub use discovery::{CatalogueEntry, DiscoverySnapshot, DiscoverySource, ResourceFilter};
pub use watch::{ChangeKind, ObjectChange, ObjectEventSink, ReconcileReport, WatchManager, WatchSource};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Group and version of an API, e.g. `apps/v1` or `v1` for the core group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersion {
    pub group: String,
    pub version: String,
}

impl GroupVersion {
    /// Parse an apiVersion string. The core group has no group prefix.
    pub fn parse(api_version: &str) -> Result<Self> {
        let parts: Vec<&str> = api_version.split('/').collect();
        match parts.as_slice() {
            [version] if !version.is_empty() => Ok(Self {
                group: String::new(),
                version: version.to_string(),
            }),
            [group, version] if !group.is_empty() && !version.is_empty() => Ok(Self {
                group: group.to_string(),
                version: version.to_string(),
            }),
            _ => Err(Error::InvalidGroupVersion(api_version.to_string())),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Group-Version-Kind: identifies an object type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// The core v1 Namespace type, whose labels feed namespace selectors
    pub fn namespace() -> Self {
        Self::new("", "v1", "Namespace")
    }

    pub fn api_version(&self) -> String {
        GroupVersion {
            group: self.group.clone(),
            version: self.version.clone(),
        }
        .api_version()
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// Group-Version-Resource: identifies an object collection endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Gvr {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Position of an object within one type's collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(String::from),
            name: name.to_string(),
        }
    }

    pub fn cluster(name: &str) -> Self {
        Self::new(None, name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_group_version() {
        let gv = GroupVersion::parse("apps/v1").unwrap();
        assert_eq!(gv.group, "apps");
        assert_eq!(gv.version, "v1");
        assert_eq!(gv.api_version(), "apps/v1");

        let core = GroupVersion::parse("v1").unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core.api_version(), "v1");
    }

    #[test]
    fn test_parse_group_version_rejects_malformed() {
        assert!(GroupVersion::parse("").is_err());
        assert!(GroupVersion::parse("a/b/c").is_err());
        assert!(GroupVersion::parse("/v1").is_err());
        assert!(GroupVersion::parse("apps/").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Gvk::new("apps", "v1", "Deployment").to_string(), "apps/v1/Deployment");
        assert_eq!(Gvk::namespace().to_string(), "v1/Namespace");
        assert_eq!(Gvr::new("", "v1", "configmaps").to_string(), "v1/configmaps");
        assert_eq!(ObjectKey::new(Some("ns1"), "cm-a").to_string(), "ns1/cm-a");
        assert_eq!(ObjectKey::cluster("n1").to_string(), "n1");
    }

    #[test]
    fn test_object_key_empty_namespace_is_cluster_scoped() {
        assert_eq!(ObjectKey::new(Some(""), "x"), ObjectKey::cluster("x"));
    }
}
