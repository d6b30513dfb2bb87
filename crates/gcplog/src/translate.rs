// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Translation of Pub/Sub messages into log entries.
//!
//! Both targets reduce what they receive to an [`Envelope`] and call
//! [`translate`]. The message is exposed to relabeling through internal labels:
//!
//! - `__gcp_message_id`
//! - `__gcp_subscription_name` (push only, the subscription the request came from)
//! - `__gcp_attributes_<name>` for every message attribute
//! - `__gcp_logname`, `__gcp_resource_type`, `__gcp_resource_labels_<name>`,
//!   `__gcp_severity` and `__gcp_labels_<name>` when the payload is a Cloud
//!   Logging `LogEntry` exported by a log sink
//!
//! Labels starting with `__` are removed once relabeling is done, except
//! [`RESERVED_LABEL_TENANT_ID`].

use std::collections::HashMap;

use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use time::{OffsetDateTime, UtcOffset};

use crate::config::TargetConfig;
use crate::entry::{
    is_valid_label_name, sanitize_label_name, Entry, LabelSet, RESERVED_LABEL_TENANT_ID,
};
use crate::errors::TranslationError;
use crate::relabel;

const LABEL_MESSAGE_ID: &str = "__gcp_message_id";
const LABEL_SUBSCRIPTION_NAME: &str = "__gcp_subscription_name";
const LABEL_ATTRIBUTES_PREFIX: &str = "__gcp_attributes_";
const LABEL_LOGNAME: &str = "__gcp_logname";
const LABEL_RESOURCE_TYPE: &str = "__gcp_resource_type";
const LABEL_RESOURCE_LABELS_PREFIX: &str = "__gcp_resource_labels_";
const LABEL_SEVERITY: &str = "__gcp_severity";
const LABEL_LABELS_PREFIX: &str = "__gcp_labels_";

/// A received message, independent of how it was delivered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
    pub data: Bytes,
    pub attributes: HashMap<String, String>,
    pub message_id: String,
    pub publish_time: Option<OffsetDateTime>,
    /// Subscription the message was delivered through, when the transport reports it.
    pub subscription: Option<String>,
}

/// Body of a request sent by a Pub/Sub push subscription.
#[derive(Clone, Debug, Deserialize)]
pub struct PushPayload {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: String,
}

/// Pub/Sub sends every field of the message in both camelCase and snake_case.
#[derive(Clone, Debug, Deserialize)]
pub struct PushMessage {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default, rename = "messageId")]
    pub message_id: Option<String>,
    #[serde(default, rename = "message_id")]
    message_id_snake: Option<String>,
    #[serde(default, rename = "publishTime", with = "time::serde::rfc3339::option")]
    pub publish_time: Option<OffsetDateTime>,
    #[serde(default, rename = "publish_time", with = "time::serde::rfc3339::option")]
    publish_time_snake: Option<OffsetDateTime>,
}

impl PushPayload {
    /// Decodes the base64 data of the message.
    pub fn into_envelope(self) -> Result<Envelope, TranslationError> {
        let PushMessage {
            data,
            attributes,
            message_id,
            message_id_snake,
            publish_time,
            publish_time_snake,
        } = self.message;

        let data = data.ok_or_else(|| TranslationError::Malformed("missing message data".to_string()))?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(data.as_bytes())
            .map_err(|e| TranslationError::Malformed(format!("failed to decode data: {e}")))?;

        Ok(Envelope {
            data: Bytes::from(data),
            attributes,
            message_id: message_id.or(message_id_snake).unwrap_or_default(),
            publish_time: publish_time.or(publish_time_snake),
            subscription: Some(self.subscription).filter(|s| !s.is_empty()),
        })
    }
}

/// The subset of a Cloud Logging `LogEntry` exposed as labels.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEntry {
    #[serde(default)]
    log_name: String,
    #[serde(default)]
    resource: Option<MonitoredResource>,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct MonitoredResource {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

fn log_entry_labels(line: &str, labels: &mut LabelSet) {
    if !line.trim_start().starts_with('{') {
        return;
    }
    let Ok(log_entry) = serde_json::from_str::<LogEntry>(line) else {
        return;
    };
    labels.set(LABEL_LOGNAME, log_entry.log_name);
    labels.set(LABEL_SEVERITY, log_entry.severity);
    if let Some(resource) = log_entry.resource {
        labels.set(LABEL_RESOURCE_TYPE, resource.kind);
        for (k, v) in resource.labels {
            labels.set(
                format!("{LABEL_RESOURCE_LABELS_PREFIX}{}", sanitize_label_name(&k)),
                v,
            );
        }
    }
    for (k, v) in log_entry.labels {
        labels.set(format!("{LABEL_LABELS_PREFIX}{}", sanitize_label_name(&k)), v);
    }
}

/// Turns `envelope` into an entry labeled with the static labels of `config`, rewritten
/// by its relabel rules. `tenant_id` comes from the push request, if any.
pub fn translate(
    envelope: &Envelope,
    config: &TargetConfig,
    tenant_id: Option<&str>,
) -> Result<Entry, TranslationError> {
    let line = std::str::from_utf8(&envelope.data)
        .map_err(|e| TranslationError::Malformed(format!("payload is not valid UTF-8: {e}")))?;

    let timestamp = if config.use_incoming_timestamp {
        envelope
            .publish_time
            .ok_or_else(|| TranslationError::Malformed("missing publish time".to_string()))?
            .to_offset(UtcOffset::UTC)
    } else {
        OffsetDateTime::now_utc()
    };

    let mut fixed = config.labels.clone();
    let mut labels = LabelSet::new();
    labels.set(LABEL_MESSAGE_ID, envelope.message_id.as_str());
    if let Some(subscription) = &envelope.subscription {
        labels.set(LABEL_SUBSCRIPTION_NAME, subscription.as_str());
    }
    for (k, v) in &envelope.attributes {
        labels.set(
            format!("{LABEL_ATTRIBUTES_PREFIX}{}", sanitize_label_name(k)),
            v.as_str(),
        );
    }
    log_entry_labels(line, &mut labels);
    if let Some(tenant_id) = tenant_id.filter(|t| !t.is_empty()) {
        labels.set(RESERVED_LABEL_TENANT_ID, tenant_id);
        fixed.set(RESERVED_LABEL_TENANT_ID, tenant_id);
    }
    labels.merge(&fixed);

    let mut labels =
        relabel::process(labels, &config.relabel_configs).ok_or(TranslationError::Dropped)?;
    labels.retain(|name, _| {
        (name == RESERVED_LABEL_TENANT_ID || !name.starts_with("__")) && is_valid_label_name(name)
    });
    labels.merge(&fixed);

    Ok(Entry::new(labels, timestamp, line.to_string()))
}
