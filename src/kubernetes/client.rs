use anyhow::{Context, anyhow};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::api::DynamicObject;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Config};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, trace, warn};

use super::discovery::{CatalogueEntry, DiscoverySnapshot, DiscoverySource};
use super::watch::{EventStream, WatchSource};
use super::{GroupVersion, Gvr, ObjectKey};
use crate::error::{Error, Result, is_retryable};
use crate::transport::ObjectResolver;

/// Timeout for connecting to K8s API
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for reading K8s API responses
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum retry attempts for transient failures
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// A client bound to one kubeconfig context
#[derive(Clone)]
pub struct ClusterClient {
    context: String,
    client: Client,
}

impl ClusterClient {
    /// Connect using a kubeconfig context, or the current context if None
    pub async fn connect(context: Option<&str>) -> anyhow::Result<Self> {
        let kubeconfig = Kubeconfig::read()?;

        let context_name = context
            .map(String::from)
            .or_else(|| kubeconfig.current_context.clone())
            .ok_or_else(|| anyhow!("No context specified and no current context in kubeconfig"))?;

        if !kubeconfig.contexts.iter().any(|c| c.name == context_name) {
            return Err(anyhow!(
                "Context '{}' not found in kubeconfig",
                context_name
            ));
        }

        let mut config = Config::from_custom_kubeconfig(
            kubeconfig,
            &KubeConfigOptions {
                context: Some(context_name.clone()),
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("Failed to load kubeconfig for context '{}'", context_name))?;

        // Set timeouts for reliability
        config.connect_timeout = Some(CONNECT_TIMEOUT);
        config.read_timeout = Some(READ_TIMEOUT);

        let client = Client::try_from(config)
            .with_context(|| format!("Failed to create client for context '{}'", context_name))?;

        info!(context = %context_name, "Connected to cluster");
        Ok(Self {
            context: context_name,
            client,
        })
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

/// Dynamic API handle description for a catalogue entry
pub(crate) fn api_resource(entry: &CatalogueEntry) -> ApiResource {
    ApiResource {
        group: entry.group.clone(),
        version: entry.version.clone(),
        api_version: entry.api_version(),
        kind: entry.kind.clone(),
        plural: entry.resource.clone(),
    }
}

/// Discovery against the API server: the core group plus every named group
/// at its preferred version
pub struct KubeDiscovery {
    client: Client,
}

impl KubeDiscovery {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn group_resources(&self, group: &str, group_version: &str) -> Result<Vec<CatalogueEntry>, kube::Error> {
        let list = if group.is_empty() {
            self.client.list_core_api_resources(group_version).await?
        } else {
            self.client.list_api_group_resources(group_version).await?
        };
        Ok(catalogue_entries(list))
    }
}

#[async_trait]
impl DiscoverySource for KubeDiscovery {
    async fn discover(&self) -> Result<DiscoverySnapshot> {
        let start = std::time::Instant::now();

        // Without the group list there is nothing usable: abort the cycle
        let core = self
            .client
            .list_core_api_versions()
            .await
            .map_err(Error::Discovery)?;
        let groups = self
            .client
            .list_api_groups()
            .await
            .map_err(Error::Discovery)?;

        let mut targets: Vec<(String, String)> = core
            .versions
            .into_iter()
            .map(|v| (String::new(), v))
            .collect();
        for group in groups.groups {
            let preferred = group
                .preferred_version
                .or_else(|| group.versions.first().cloned());
            match preferred {
                Some(gv) => targets.push((group.name, gv.group_version)),
                None => warn!(group = %group.name, "API group has no versions, skipping"),
            }
        }

        // Query groups in parallel
        let results = futures::future::join_all(
            targets
                .iter()
                .map(|(group, gv)| self.group_resources(group, gv)),
        )
        .await;

        let mut snapshot = DiscoverySnapshot::default();
        for ((group, gv), result) in targets.into_iter().zip(results) {
            match result {
                Ok(entries) => snapshot.entries.extend(entries),
                Err(e) => {
                    warn!(group = %group, group_version = %gv, error = %e, "Failed to discover API group");
                    if !snapshot.failed_groups.contains(&group) {
                        snapshot.failed_groups.push(group);
                    }
                }
            }
        }

        debug!(
            resource_types = snapshot.entries.len(),
            failed_groups = snapshot.failed_groups.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Discovery pass complete"
        );
        Ok(snapshot)
    }
}

/// Convert one group-version's resource list into catalogue entries.
/// Subresources are skipped; a malformed group-version yields nothing.
fn catalogue_entries(list: APIResourceList) -> Vec<CatalogueEntry> {
    let gv = match GroupVersion::parse(&list.group_version) {
        Ok(gv) => gv,
        Err(e) => {
            warn!(error = %e, "Skipping resource list");
            return Vec::new();
        }
    };

    list.resources
        .into_iter()
        // Skip subresources (e.g., pods/log, pods/exec)
        .filter(|r| !r.name.contains('/'))
        .map(|r| CatalogueEntry {
            group: r.group.unwrap_or_else(|| gv.group.clone()),
            version: r.version.unwrap_or_else(|| gv.version.clone()),
            kind: r.kind,
            resource: r.name,
            namespaced: r.namespaced,
            verbs: r.verbs,
        })
        .collect()
}

/// Opens list+watch streams against the API server
pub struct KubeWatchSource {
    client: Client,
}

impl KubeWatchSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl WatchSource for KubeWatchSource {
    fn watch(&self, entry: &CatalogueEntry) -> EventStream {
        let ar = api_resource(entry);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed()
    }
}

/// Wake `notify` whenever a CustomResourceDefinition is created, changed or
/// deleted, so discovery runs ahead of its interval. Returns on shutdown.
pub async fn watch_crd_changes(
    client: Client,
    notify: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = stream.next() => match event {
                Some(Ok(watcher::Event::Apply(crd))) | Some(Ok(watcher::Event::Delete(crd))) => {
                    debug!(crd = ?crd.metadata.name, "CRD changed, triggering discovery");
                    notify.notify_one();
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => warn!(error = %e, "CRD watch error"),
                None => break,
            },
        }
    }
    trace!("CRD watch exiting");
}

/// Resolves references with a live GET against the source cluster
pub struct ApiResolver {
    client: Client,
}

impl ApiResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// GET with retry logic for transient failures
    async fn get_with_retry(
        &self,
        api: &Api<DynamicObject>,
        gvr: &Gvr,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>> {
        let mut attempt = 0;
        loop {
            match api.get_opt(&key.name).await {
                Ok(obj) => return Ok(obj),
                Err(e) if is_retryable(&e) && attempt + 1 < MAX_RETRIES => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    warn!(
                        gvr = %gvr,
                        object = %key,
                        attempt = attempt + 1,
                        max_attempts = MAX_RETRIES,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Retryable error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(gvr = %gvr, object = %key, error = %e, "Non-retryable error");
                    return Err(e.into());
                }
            }
        }
    }
}

#[async_trait]
impl ObjectResolver for ApiResolver {
    async fn resolve(&self, gvr: &Gvr, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let ar = ApiResource {
            group: gvr.group.clone(),
            version: gvr.version.clone(),
            api_version: GroupVersion {
                group: gvr.group.clone(),
                version: gvr.version.clone(),
            }
            .api_version(),
            // Only the URL parts matter for a GET
            kind: String::new(),
            plural: gvr.resource.clone(),
        };
        let api: Api<DynamicObject> = match &key.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        self.get_with_retry(&api, gvr, key).await
    }
}
