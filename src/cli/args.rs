// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "kubedownsync")]
#[command(author, version, about = "Downsync Kubernetes objects selected by policy to edge clusters")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Kubeconfig context of the source cluster
    #[arg(short, long, value_name = "CONTEXT", global = true)]
    pub context: Option<String>,

    /// Kubeconfig context bundles are delivered to (defaults to --context)
    #[arg(long, value_name = "CONTEXT", global = true)]
    pub transport_context: Option<String>,

    /// Config file (defaults to ~/.kubedownsync/config.json)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// API groups to watch, comma-separated; "core" selects the core group
    #[arg(long, value_delimiter = ',', global = true)]
    pub allowed_groups: Option<Vec<String>>,

    /// Worker tasks per queue
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    /// Field manager whose fields are delivered (repeatable)
    #[arg(short, long = "manager", value_name = "MANAGER", global = true)]
    pub managers: Vec<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also log to stderr
    #[arg(long, global = true)]
    pub log_stderr: bool,
}

impl Args {
    /// Apply command line overrides on top of the file configuration
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(groups) = &self.allowed_groups {
            config.allowed_groups = groups
                .iter()
                .map(|g| if g == "core" { String::new() } else { g.clone() })
                .collect();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if !self.managers.is_empty() {
            config.manager_identities = self.managers.clone();
        }
        if self.transport_context.is_some() {
            config.transport_context = self.transport_context.clone();
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the controller until interrupted (default)
    Run,

    /// Run one discovery pass and print the watchable resource types
    Discover,

    /// Print the field-ownership projection of a stored object
    Project {
        /// Object manifest (JSON or YAML) including metadata.managedFields
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_none() {
        let args = Args::parse_from(["kubedownsync"]);
        assert!(args.command.is_none());
        assert_eq!(args.output, OutputFormat::Table);
    }

    #[test]
    fn test_project_subcommand() {
        let args = Args::parse_from(["kubedownsync", "project", "--file", "obj.yaml", "-o", "yaml"]);
        assert_eq!(
            args.command,
            Some(Command::Project {
                file: PathBuf::from("obj.yaml")
            })
        );
        assert_eq!(args.output, OutputFormat::Yaml);
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let args = Args::parse_from([
            "kubedownsync",
            "--allowed-groups",
            "apps,core",
            "--workers",
            "2",
            "--manager",
            "argocd",
            "--manager",
            "kubectl",
            "--transport-context",
            "hub",
            "run",
        ]);
        let mut config = Config::default();
        args.apply_to(&mut config);
        assert_eq!(config.allowed_groups, vec!["apps", ""]);
        assert_eq!(config.workers, 2);
        assert_eq!(config.manager_identities, vec!["argocd", "kubectl"]);
        assert_eq!(config.transport_context.as_deref(), Some("hub"));
    }

    #[test]
    fn test_no_overrides_keep_file_values() {
        let args = Args::parse_from(["kubedownsync", "discover"]);
        let mut config = Config {
            workers: 7,
            ..Default::default()
        };
        args.apply_to(&mut config);
        assert_eq!(config.workers, 7);
        assert_eq!(config, Config { workers: 7, ..Default::default() });
    }
}
