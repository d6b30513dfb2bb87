// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Label name carrying the tenant a push request was made for. It survives the
/// removal of internal `__` labels so the downstream client can route on it.
pub const RESERVED_LABEL_TENANT_ID: &str = "__tenant_id__";

/// Ordered set of `(name, value)` label pairs, unique by name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Sets `name` to `value`. An empty value removes the label.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if value.is_empty() {
            self.0.remove(&name);
        } else {
            self.0.insert(name, value);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copies every label of `other` into `self`, overriding labels with the same name.
    pub fn merge(&mut self, other: &LabelSet) {
        for (name, value) in other.iter() {
            self.set(name, value);
        }
    }

    /// Keeps only the labels for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &str) -> bool) {
        self.0.retain(|k, v| keep(k, v));
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut labels = LabelSet::new();
        for (k, v) in iter {
            labels.set(k, v);
        }
        labels
    }
}

/// Returns true if `name` matches `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Replaces every character not allowed in a label name with `_`.
pub fn sanitize_label_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// A single log line with its labels and timestamp, as handed to the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Entry {
    labels: LabelSet,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    line: String,
}

impl Entry {
    pub fn new(labels: LabelSet, timestamp: OffsetDateTime, line: String) -> Self {
        Entry {
            labels,
            timestamp,
            line,
        }
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn line(&self) -> &str {
        &self.line
    }
}
