// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Label rewriting rules applied to every translated message.
//!
//! Rules run in order over the full label set of a message, including the
//! internal `__gcp_*` labels, so they can promote internal labels to visible
//! ones or drop the message entirely.
//!
//! ```json
//! [
//!   {"source_labels": ["__gcp_attributes_logging_googleapis_com_timestamp"], "target_label": "ts"},
//!   {"action": "drop", "source_labels": ["__gcp_severity"], "regex": "DEBUG"},
//!   {"action": "labelmap", "regex": "__gcp_labels_(.+)"}
//! ]
//! ```
//!
//! Regular expressions are fully anchored: `regex: "DEBUG"` does not match `"DEBUG2"`.

use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::entry::{is_valid_label_name, LabelSet};

const DEFAULT_SEPARATOR: &str = ";";
const DEFAULT_REGEX: &str = "(.*)";
const DEFAULT_REPLACEMENT: &str = "$1";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Write `replacement` (with capture groups expanded) into `target_label`
    /// when `regex` matches the joined source values.
    #[default]
    Replace,
    /// Drop the message unless `regex` matches the joined source values.
    Keep,
    /// Drop the message when `regex` matches the joined source values.
    Drop,
    /// Copy every label whose name matches `regex` to the name given by `replacement`.
    LabelMap,
    /// Remove every label whose name matches `regex`.
    LabelDrop,
    /// Remove every label whose name does not match `regex`.
    LabelKeep,
    Lowercase,
    Uppercase,
}

/// An anchored regular expression that remembers the pattern it was built from.
#[derive(Clone, Debug)]
pub struct RelabelRegex {
    pattern: String,
    regex: Regex,
}

impl RelabelRegex {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("^(?:{pattern})$"))?;
        Ok(RelabelRegex {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    /// Expands `template` against the captures of `value`, or returns None if `value` does not match.
    fn expand(&self, value: &str, template: &str) -> Option<String> {
        let captures = self.regex.captures(value)?;
        let mut out = String::new();
        captures.expand(template, &mut out);
        Some(out)
    }
}

impl Default for RelabelRegex {
    fn default() -> Self {
        #[allow(clippy::expect_used)]
        let regex = RelabelRegex::new(DEFAULT_REGEX).expect("default relabel regex is valid");
        regex
    }
}

impl PartialEq for RelabelRegex {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl<'de> Deserialize<'de> for RelabelRegex {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pattern = String::deserialize(deserializer)?;
        RelabelRegex::new(&pattern).map_err(serde::de::Error::custom)
    }
}

#[derive(Deserialize)]
struct RawRelabelConfig {
    #[serde(default)]
    source_labels: Vec<String>,
    #[serde(default)]
    separator: Option<String>,
    #[serde(default)]
    regex: Option<RelabelRegex>,
    #[serde(default)]
    target_label: Option<String>,
    #[serde(default)]
    replacement: Option<String>,
    #[serde(default)]
    action: Action,
}

/// One relabeling rule.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "RawRelabelConfig")]
pub struct RelabelConfig {
    pub source_labels: Vec<String>,
    pub separator: String,
    pub regex: RelabelRegex,
    pub target_label: String,
    pub replacement: String,
    pub action: Action,
}

impl Default for RelabelConfig {
    fn default() -> Self {
        RelabelConfig {
            source_labels: Vec::new(),
            separator: DEFAULT_SEPARATOR.to_string(),
            regex: RelabelRegex::default(),
            target_label: String::new(),
            replacement: DEFAULT_REPLACEMENT.to_string(),
            action: Action::Replace,
        }
    }
}

impl TryFrom<RawRelabelConfig> for RelabelConfig {
    type Error = String;

    fn try_from(raw: RawRelabelConfig) -> Result<Self, Self::Error> {
        let config = RelabelConfig {
            source_labels: raw.source_labels,
            separator: raw.separator.unwrap_or_else(|| DEFAULT_SEPARATOR.to_string()),
            regex: raw.regex.unwrap_or_default(),
            target_label: raw.target_label.unwrap_or_default(),
            replacement: raw
                .replacement
                .unwrap_or_else(|| DEFAULT_REPLACEMENT.to_string()),
            action: raw.action,
        };
        config.validate()?;
        Ok(config)
    }
}

impl RelabelConfig {
    fn validate(&self) -> Result<(), String> {
        match self.action {
            Action::Replace | Action::Lowercase | Action::Uppercase
                if self.target_label.is_empty() =>
            {
                Err(format!("relabel action {:?} requires a target_label", self.action))
            }
            Action::Lowercase | Action::Uppercase if !is_valid_label_name(&self.target_label) => {
                Err(format!("invalid target_label {:?}", self.target_label))
            }
            Action::Keep | Action::Drop if self.source_labels.is_empty() => Err(format!(
                "relabel action {:?} requires source_labels",
                self.action
            )),
            _ => Ok(()),
        }
    }
}

/// Applies `rules` in order to `labels`. Returns None if a rule dropped the message.
pub fn process(mut labels: LabelSet, rules: &[RelabelConfig]) -> Option<LabelSet> {
    for rule in rules {
        if !apply(&mut labels, rule) {
            return None;
        }
    }
    Some(labels)
}

/// Applies a single rule, returning false if the message must be dropped.
fn apply(labels: &mut LabelSet, rule: &RelabelConfig) -> bool {
    let value = rule
        .source_labels
        .iter()
        .map(|name| labels.get(name).unwrap_or(""))
        .collect::<Vec<&str>>()
        .join(&rule.separator);

    match rule.action {
        Action::Keep => rule.regex.is_match(&value),
        Action::Drop => !rule.regex.is_match(&value),
        Action::Replace => {
            let Some(target) = rule.regex.expand(&value, &rule.target_label) else {
                return true;
            };
            let Some(replaced) = rule.regex.expand(&value, &rule.replacement) else {
                return true;
            };
            if is_valid_label_name(&target) {
                labels.set(target, replaced);
            }
            true
        }
        Action::Lowercase => {
            labels.set(rule.target_label.clone(), value.to_lowercase());
            true
        }
        Action::Uppercase => {
            labels.set(rule.target_label.clone(), value.to_uppercase());
            true
        }
        Action::LabelMap => {
            let mapped: Vec<(String, String)> = labels
                .iter()
                .filter_map(|(name, value)| {
                    rule.regex
                        .expand(name, &rule.replacement)
                        .map(|new_name| (new_name, value.to_string()))
                })
                .collect();
            for (name, value) in mapped {
                if is_valid_label_name(&name) {
                    labels.set(name, value);
                }
            }
            true
        }
        Action::LabelDrop => {
            labels.retain(|name, _| !rule.regex.is_match(name));
            true
        }
        Action::LabelKeep => {
            labels.retain(|name, _| rule.regex.is_match(name));
            true
        }
    }
}
