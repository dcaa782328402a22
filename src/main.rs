// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use futures::StreamExt;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use kubedownsync::binding::{BindingController, BindingWork, KubeBindingStore};
use kubedownsync::cli::{Args, Command};
use kubedownsync::config::{self, Config};
use kubedownsync::kubernetes::{
    ApiResolver, ClusterClient, DiscoverySource, KubeDiscovery, KubeWatchSource, ResourceFilter,
    WatchManager, watch_crd_changes,
};
use kubedownsync::output;
use kubedownsync::ownership::FieldOwnershipProjector;
use kubedownsync::policy::{Binding, BindingPolicy};
use kubedownsync::progress::{create_progress_handle, log_updates};
use kubedownsync::transport::{
    ConfigMapBundleTransport, KubeApplySink, ObjectResolver, TransportOrchestrator,
    strip_server_fields,
};
use kubedownsync::workqueue::WorkQueue;

/// Initialize logging with file output and optional stderr
fn init_logging(verbose: bool, to_stderr: bool) {
    use tracing_rolling_file::{RollingConditionBase, RollingFileAppenderBase};
    use tracing_subscriber::fmt::format::FmtSpan;

    let log_dir = config::base_dir()
        .map(|p| p.join("log"))
        .unwrap_or_else(|_| std::path::PathBuf::from("."));

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: Could not create log directory: {}", e);
        return;
    }

    // Rotate daily or at 10MB, keeping 5 files
    let log_path = log_dir.join("kubedownsync.log");
    let condition = RollingConditionBase::new()
        .daily()
        .max_size(10 * 1024 * 1024);

    let file_appender = match RollingFileAppenderBase::new(log_path, condition, 5) {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("Warning: Could not create log file: {}", e);
            return;
        }
    };

    let (non_blocking, _guard) = file_appender.get_non_blocking_appender();
    // Leak the guard to keep the background writer alive
    std::mem::forget(_guard);

    let filter = if verbose {
        "kubedownsync=debug"
    } else {
        "kubedownsync=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_span_events(FmtSpan::NONE);

    if to_stderr {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::NONE);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(stderr_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (aws-lc-rs)
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let args = Args::parse();
    init_logging(args.verbose, args.log_stderr);

    let mut config = Config::load(args.config.as_deref())?;
    args.apply_to(&mut config);

    match args.command.clone().unwrap_or(Command::Run) {
        Command::Run => run(&args, config).await,
        Command::Discover => discover(&args, &config).await,
        Command::Project { file } => project(&args, &config, &file),
    }
}

fn resource_filter(config: &Config) -> ResourceFilter {
    ResourceFilter::new(
        &config.allowed_groups,
        &config.excluded_groups,
        &config.excluded_resources,
    )
}

async fn discover(args: &Args, config: &Config) -> Result<()> {
    let source = ClusterClient::connect(args.context.as_deref()).await?;
    let snapshot = KubeDiscovery::new(source.client())
        .discover()
        .await
        .with_context(|| format!("Discovery failed on '{}'", source.context()))?;
    if snapshot.is_incomplete() {
        eprintln!(
            "Warning: discovery incomplete, failed groups: {}",
            snapshot.failed_groups.join(", ")
        );
    }

    let filter = resource_filter(config);
    let listing = output::catalogue_listing(filter.allowed(&snapshot));
    println!("{}", listing.format(&args.output, false));
    Ok(())
}

fn project(args: &Args, config: &Config, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    // YAML is a superset of JSON
    let obj: kube::api::DynamicObject = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse object from {}", file.display()))?;

    let projector = FieldOwnershipProjector::new(config.manager_identities.clone());
    let mut doc = projector.project(&obj)?;
    strip_server_fields(&mut doc);
    println!("{}", output::format_document(&doc, &args.output)?);
    Ok(())
}

async fn run(args: &Args, config: Config) -> Result<()> {
    let source = ClusterClient::connect(args.context.as_deref()).await?;
    let target = match config.transport_context.as_deref() {
        Some(ctx) if ctx != source.context() => ClusterClient::connect(Some(ctx)).await?,
        _ => source.clone(),
    };
    info!(
        source = %source.context(),
        transport = %target.context(),
        workers = config.workers,
        "Starting downsync controller"
    );

    let progress = create_progress_handle();
    let progress_updates = progress.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let binding_queue = Arc::new(WorkQueue::<BindingWork>::new());
    let watches = Arc::new(WatchManager::new(
        Arc::new(KubeWatchSource::new(source.client())),
        resource_filter(&config),
        binding_queue.clone(),
        progress.clone(),
    ));

    let resolver: Arc<dyn ObjectResolver> = if config.live_resolve {
        Arc::new(ApiResolver::new(source.client()))
    } else {
        watches.clone()
    };
    let orchestrator = Arc::new(TransportOrchestrator::new(
        ConfigMapBundleTransport::new(&config.bundle_key),
        resolver,
        Arc::new(KubeApplySink::new(target.client(), &config.field_manager)),
        FieldOwnershipProjector::new(config.manager_identities.clone()),
        config.orchestrator(),
        shutdown_rx.clone(),
        progress.clone(),
    ));
    let controller = Arc::new(BindingController::new(
        watches.clone(),
        Arc::new(KubeBindingStore::new(source.client(), &config.field_manager)),
        orchestrator.clone(),
        binding_queue.clone(),
        progress.clone(),
    ));

    let discovery = KubeDiscovery::new(source.client());
    let report = watches
        .refresh(&discovery)
        .await
        .with_context(|| format!("Initial discovery failed on '{}'", source.context()))?;
    info!(watches = report.started.len(), "Initial watches started");

    let mut tasks = controller.run(config.workers);
    tasks.extend(orchestrator.run(config.workers));
    tasks.push(tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move {
            let seen = log_updates(progress_updates, shutdown).await;
            debug!(updates = seen, "Progress log stopped");
        }
    }));

    let crd_changed = Arc::new(Notify::new());
    tasks.push(tokio::spawn(watch_crd_changes(
        source.client(),
        crd_changed.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(discovery_loop(
        watches.clone(),
        controller.clone(),
        discovery,
        crd_changed,
        config.discovery_interval(),
        shutdown_rx.clone(),
    )));

    {
        let on_apply = controller.clone();
        let on_delete = controller.clone();
        tasks.push(tokio::spawn(follow(
            Api::<BindingPolicy>::all(source.client()),
            shutdown_rx.clone(),
            move |policy| on_apply.policy_changed(policy),
            move |name| on_delete.policy_deleted(name),
        )));
    }
    {
        let on_apply = orchestrator.clone();
        let on_delete = orchestrator.clone();
        tasks.push(tokio::spawn(follow(
            Api::<Binding>::all(source.client()),
            shutdown_rx.clone(),
            move |binding: Binding| on_apply.binding_changed(&binding.name_any(), binding.spec),
            move |name| on_delete.binding_deleted(name),
        )));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    binding_queue.shutdown();
    orchestrator.shutdown();
    watches.stop_all().await;
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Task ended abnormally");
        }
    }

    let (active_watches, deliveries) = progress.counters();
    info!(active_watches, deliveries, "Stopped");
    Ok(())
}

/// Re-run discovery on an interval and whenever a CRD changes
async fn discovery_loop(
    watches: Arc<WatchManager>,
    controller: Arc<BindingController>,
    discovery: KubeDiscovery,
    crd_changed: Arc<Notify>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; initial discovery already ran
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
            _ = crd_changed.notified() => debug!("Discovery triggered by CRD change"),
        }
        match watches.refresh(&discovery).await {
            Ok(report) => {
                if !report.stopped.is_empty() {
                    controller.types_stopped(&report.stopped);
                }
                debug!(
                    started = report.started.len(),
                    stopped = report.stopped.len(),
                    retained = report.retained.len(),
                    "Discovery reconciled"
                );
            }
            Err(e) => warn!(error = %e, "Discovery failed, keeping current watches"),
        }
    }
}

/// Follow a cluster-scoped resource, reporting applies and deletions by
/// name. Objects missing from a relist are reported deleted.
async fn follow<K>(
    api: Api<K>,
    mut shutdown: watch::Receiver<bool>,
    on_apply: impl Fn(K) + Send + 'static,
    on_delete: impl Fn(&str) + Send + 'static,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let kind = K::kind(&()).to_string();
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut known: HashSet<String> = HashSet::new();
    let mut relisted: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = stream.next() => match event {
                Some(Ok(watcher::Event::Init)) => relisted.clear(),
                Some(Ok(watcher::Event::InitApply(obj))) => {
                    let name = obj.name_any();
                    relisted.insert(name.clone());
                    known.insert(name);
                    on_apply(obj);
                }
                Some(Ok(watcher::Event::InitDone)) => {
                    let gone: Vec<String> = known.difference(&relisted).cloned().collect();
                    for name in gone {
                        known.remove(&name);
                        on_delete(&name);
                    }
                }
                Some(Ok(watcher::Event::Apply(obj))) => {
                    known.insert(obj.name_any());
                    on_apply(obj);
                }
                Some(Ok(watcher::Event::Delete(obj))) => {
                    let name = obj.name_any();
                    known.remove(&name);
                    on_delete(&name);
                }
                Some(Err(e)) => warn!(kind = %kind, error = %e, "Watch error"),
                None => break,
            },
        }
    }
    debug!(kind = %kind, "Watch exiting");
}
