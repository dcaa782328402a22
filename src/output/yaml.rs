// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use super::Listing;

pub struct YamlFormatter;

impl YamlFormatter {
    pub fn format(listing: &Listing) -> String {
        let rows = listing.to_json_rows();
        serde_yaml::to_string(&rows).unwrap_or_else(|_| "[]".to_string())
    }
}
