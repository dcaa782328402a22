// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Binding projection and the controller that maintains Bindings

pub mod controller;

pub use controller::{BindingController, BindingStore, BindingWork, ContentObserver, KubeBindingStore};

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::kubernetes::{Gvr, ObjectKey};
use crate::policy::{
    ClusterScopeResource, DownsyncWorkload, NamespaceObjects, NamespaceScopeResource,
};

/// Reference to one object through its collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub gvr: Gvr,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(gvr: Gvr, namespace: Option<&str>, name: &str) -> Self {
        let key = ObjectKey::new(namespace, name);
        Self {
            gvr,
            namespace: key.namespace,
            name: key.name,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.as_deref(), &self.name)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.gvr, self.key())
    }
}

/// Folds a matched object set into the compact Binding workload shape
pub struct BindingProjector;

impl BindingProjector {
    /// Buckets by collection and scope. Names keep first-seen order and
    /// duplicate references collapse, so the same input always yields the
    /// same workload.
    pub fn project<'a>(matched: impl IntoIterator<Item = &'a ObjectRef>) -> DownsyncWorkload {
        let mut workload = DownsyncWorkload::default();
        let mut seen: HashSet<&ObjectRef> = HashSet::new();
        let mut cluster_index: HashMap<&Gvr, usize> = HashMap::new();
        let mut namespace_index: HashMap<&Gvr, usize> = HashMap::new();
        let mut bucket_index: HashMap<(&Gvr, &str), usize> = HashMap::new();

        for obj in matched {
            if !seen.insert(obj) {
                continue;
            }
            match &obj.namespace {
                None => {
                    let idx = *cluster_index.entry(&obj.gvr).or_insert_with(|| {
                        workload.cluster_scope.push(ClusterScopeResource {
                            gvr: obj.gvr.clone(),
                            object_names: Vec::new(),
                        });
                        workload.cluster_scope.len() - 1
                    });
                    workload.cluster_scope[idx].object_names.push(obj.name.clone());
                }
                Some(namespace) => {
                    let idx = *namespace_index.entry(&obj.gvr).or_insert_with(|| {
                        workload.namespace_scope.push(NamespaceScopeResource {
                            gvr: obj.gvr.clone(),
                            objects_by_namespace: Vec::new(),
                        });
                        workload.namespace_scope.len() - 1
                    });
                    let resource = &mut workload.namespace_scope[idx];
                    let bucket = *bucket_index
                        .entry((&obj.gvr, namespace.as_str()))
                        .or_insert_with(|| {
                            resource.objects_by_namespace.push(NamespaceObjects {
                                namespace: namespace.clone(),
                                names: Vec::new(),
                            });
                            resource.objects_by_namespace.len() - 1
                        });
                    resource.objects_by_namespace[bucket]
                        .names
                        .push(obj.name.clone());
                }
            }
        }
        workload
    }

    /// Every object reference in a workload, cluster-scoped first
    pub fn references(workload: &DownsyncWorkload) -> Vec<ObjectRef> {
        let cluster = workload.cluster_scope.iter().flat_map(|r| {
            r.object_names
                .iter()
                .map(move |name| ObjectRef::new(r.gvr.clone(), None, name))
        });
        let namespaced = workload.namespace_scope.iter().flat_map(|r| {
            r.objects_by_namespace.iter().flat_map(move |o| {
                o.names
                    .iter()
                    .map(move |name| ObjectRef::new(r.gvr.clone(), Some(&o.namespace), name))
            })
        });
        cluster.chain(namespaced).collect()
    }
}
