// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Transport boundary: object resolution, wrapping and delivery

pub mod orchestrator;

pub use orchestrator::{CycleState, OrchestratorConfig, TransportOrchestrator};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{DeleteParams, DynamicObject, ObjectMeta, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::kubernetes::{Gvr, ObjectKey, WatchManager};

/// Label carrying the Binding name on delivered wrappers
pub const BINDING_LABEL: &str = "control.kubedownsync.io/binding";

/// Metadata fields populated by the source API server, never delivered
const SERVER_METADATA: &[&str] = &[
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "managedFields",
    "selfLink",
    "ownerReferences",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
];

/// Wraps a batch of prepared objects into a transport-specific envelope
pub trait Transport: Send + Sync {
    type Wrapper: Send + Sync + 'static;

    fn wrap_objects(&self, objects: Vec<Value>) -> Result<Self::Wrapper>;
}

/// Hands a wrapper to destinations
#[async_trait]
pub trait DeliverySink<W: Send + Sync>: Send + Sync {
    async fn deliver(&self, binding: &str, destinations: &[String], wrapper: &W) -> Result<()>;

    /// Remove a Binding's wrapper from destinations
    async fn withdraw(&self, binding: &str, destinations: &[String]) -> Result<()>;
}

/// Looks up the live object behind a Binding reference. `Ok(None)` means
/// the object does not exist.
#[async_trait]
pub trait ObjectResolver: Send + Sync {
    async fn resolve(&self, gvr: &Gvr, key: &ObjectKey) -> Result<Option<DynamicObject>>;
}

#[async_trait]
impl ObjectResolver for WatchManager {
    async fn resolve(&self, gvr: &Gvr, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        Ok(self.get_by_gvr(gvr, key)?.map(|obj| (*obj).clone()))
    }
}

/// Drop server-populated metadata and status from a document
pub fn strip_server_fields(doc: &mut Value) {
    let Value::Object(map) = doc else {
        return;
    };
    map.remove("status");
    if let Some(Value::Object(metadata)) = map.get_mut("metadata") {
        for field in SERVER_METADATA {
            metadata.remove(*field);
        }
    }
}

/// Bundles objects as a JSON array under one ConfigMap key
#[derive(Debug, Clone)]
pub struct ConfigMapBundleTransport {
    bundle_key: String,
}

impl ConfigMapBundleTransport {
    pub fn new(bundle_key: &str) -> Self {
        Self {
            bundle_key: bundle_key.to_string(),
        }
    }

    /// Read the objects back out of a bundle
    pub fn unwrap_objects(&self, wrapper: &ConfigMap) -> Result<Vec<Value>> {
        let raw = wrapper
            .data
            .as_ref()
            .and_then(|d| d.get(&self.bundle_key))
            .ok_or_else(|| Error::Transport(format!("bundle key '{}' missing", self.bundle_key)))?;
        Ok(serde_json::from_str(raw)?)
    }
}

impl Transport for ConfigMapBundleTransport {
    type Wrapper = ConfigMap;

    fn wrap_objects(&self, objects: Vec<Value>) -> Result<ConfigMap> {
        let bundle = serde_json::to_string(&objects)?;
        Ok(ConfigMap {
            data: Some(BTreeMap::from([(self.bundle_key.clone(), bundle)])),
            ..Default::default()
        })
    }
}

/// Server-side applies bundles into the namespace named after each
/// destination cluster
pub struct KubeApplySink {
    client: Client,
    field_manager: String,
}

impl KubeApplySink {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
        }
    }
}

#[async_trait]
impl DeliverySink<ConfigMap> for KubeApplySink {
    async fn deliver(&self, binding: &str, destinations: &[String], wrapper: &ConfigMap) -> Result<()> {
        let mut bundle = wrapper.clone();
        bundle.metadata = ObjectMeta {
            name: Some(binding.to_string()),
            labels: Some(BTreeMap::from([(
                BINDING_LABEL.to_string(),
                binding.to_string(),
            )])),
            ..Default::default()
        };
        let params = PatchParams::apply(&self.field_manager).force();

        for destination in destinations {
            let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), destination);
            api.patch(binding, &params, &Patch::Apply(&bundle)).await?;
            debug!(binding = %binding, destination = %destination, "Applied bundle");
        }
        Ok(())
    }

    async fn withdraw(&self, binding: &str, destinations: &[String]) -> Result<()> {
        for destination in destinations {
            let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), destination);
            match api.delete(binding, &DeleteParams::default()).await {
                Ok(_) => debug!(binding = %binding, destination = %destination, "Withdrew bundle"),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
