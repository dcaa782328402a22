// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Rendering of CLI results as table, JSON or YAML

mod json;
mod table;
mod yaml;

pub use json::JsonFormatter;
pub use table::TableFormatter;
pub use yaml::YamlFormatter;

use serde_json::{Map, Value};

use crate::cli::OutputFormat;
use crate::kubernetes::CatalogueEntry;

/// Rows of string cells under named columns
#[derive(Debug, Clone)]
pub struct Listing {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Listing {
    pub fn format(&self, format: &OutputFormat, no_headers: bool) -> String {
        match format {
            OutputFormat::Table => TableFormatter::format(self, no_headers),
            OutputFormat::Json => JsonFormatter::format(self),
            OutputFormat::Yaml => YamlFormatter::format(self),
        }
    }

    /// One JSON object per row keyed by column name
    pub fn to_json_rows(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(col, val)| (col.clone(), Value::String(val.clone())))
                    .collect()
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Listing of catalogue entries as printed by `discover`
pub fn catalogue_listing<'a>(entries: impl IntoIterator<Item = &'a CatalogueEntry>) -> Listing {
    let mut rows: Vec<Vec<String>> = entries
        .into_iter()
        .map(|e| {
            vec![
                e.group.clone(),
                e.version.clone(),
                e.kind.clone(),
                e.resource.clone(),
                if e.namespaced { "Namespaced" } else { "Cluster" }.to_string(),
                e.verbs.join(","),
            ]
        })
        .collect();
    rows.sort();
    Listing {
        columns: ["group", "version", "kind", "resource", "scope", "verbs"]
            .iter()
            .map(|c| c.to_string())
            .collect(),
        rows,
    }
}

/// Render a single document (e.g. a projected object)
pub fn format_document(doc: &Value, format: &OutputFormat) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Yaml => serde_yaml::to_string(doc)?,
        OutputFormat::Json | OutputFormat::Table => serde_json::to_string_pretty(doc)?,
    })
}
