// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Configuration persistence for kubedownsync
//!
//! All kubedownsync data is stored under ~/.kubedownsync/:
//! - ~/.kubedownsync/config.json - controller configuration
//! - ~/.kubedownsync/log/ - rotated log files

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transport::OrchestratorConfig;

/// Get the base kubedownsync directory (~/.kubedownsync/)
pub fn base_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|p| p.join(".kubedownsync"))
        .context("Could not determine home directory")
}

fn default_workers() -> usize {
    4
}

fn default_discovery_interval() -> u64 {
    60
}

fn default_resolve_timeout() -> u64 {
    5
}

fn default_deliver_timeout() -> u64 {
    30
}

fn default_manager_identities() -> Vec<String> {
    [
        "kubectl",
        "kubectl-client-side-apply",
        "kubectl-create",
        "kubectl-edit",
        "helm",
    ]
    .iter()
    .map(|m| m.to_string())
    .collect()
}

fn default_field_manager() -> String {
    "kubedownsync".to_string()
}

fn default_bundle_key() -> String {
    "manifests.json".to_string()
}

/// kubedownsync configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Groups to watch; empty means every group
    #[serde(default)]
    pub allowed_groups: Vec<String>,

    /// Added to the built-in group exclusions
    #[serde(default)]
    pub excluded_groups: Vec<String>,

    /// Added to the built-in resource exclusions
    #[serde(default)]
    pub excluded_resources: Vec<String>,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,

    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_secs: u64,

    #[serde(default = "default_deliver_timeout")]
    pub deliver_timeout_secs: u64,

    /// Field managers whose fields are delivered
    #[serde(default = "default_manager_identities")]
    pub manager_identities: Vec<String>,

    /// Identity this controller writes with
    #[serde(default = "default_field_manager")]
    pub field_manager: String,

    /// ConfigMap key holding a delivered bundle
    #[serde(default = "default_bundle_key")]
    pub bundle_key: String,

    /// Resolve Binding references with live GETs instead of the watch cache
    #[serde(default)]
    pub live_resolve: bool,

    /// Context of the cluster bundles are delivered to; defaults to the
    /// source context
    #[serde(default)]
    pub transport_context: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allowed_groups: Vec::new(),
            excluded_groups: Vec::new(),
            excluded_resources: Vec::new(),
            workers: default_workers(),
            discovery_interval_secs: default_discovery_interval(),
            resolve_timeout_secs: default_resolve_timeout(),
            deliver_timeout_secs: default_deliver_timeout(),
            manager_identities: default_manager_identities(),
            field_manager: default_field_manager(),
            bundle_key: default_bundle_key(),
            live_resolve: false,
            transport_context: None,
        }
    }
}

impl Config {
    /// Load config from the given path or ~/.kubedownsync/config.json,
    /// returning defaults if the file does not exist
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Save config to disk
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Get the config file path (~/.kubedownsync/config.json)
    pub fn config_path() -> Result<PathBuf> {
        Ok(base_dir()?.join("config.json"))
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs.max(1))
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            resolve_timeout: Duration::from_secs(self.resolve_timeout_secs),
            deliver_timeout: Duration::from_secs(self.deliver_timeout_secs),
            ..Default::default()
        }
    }
}
