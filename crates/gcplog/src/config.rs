// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::entry::{is_valid_label_name, LabelSet};
use crate::errors::ConfigError;
use crate::relabel::RelabelConfig;

pub const DEFAULT_PUSH_PATH: &str = "/gcp/api/v1/push";
const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
const DEFAULT_LISTEN_PORT: u16 = 8080;
const DEFAULT_MAX_REQUEST_CONTENT_LENGTH: usize = 10 * 1024 * 1024; // 10MB in Bytes
const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
const PUSH_METRIC_NAMESPACE_PREFIX: &str = "gcplog_push_target_";

/// How messages reach the target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    /// The target opens the subscription and pulls messages.
    #[default]
    Pull,
    /// Pub/Sub posts messages to the target's HTTP endpoint.
    Push,
}

/// HTTP server settings of a push target.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_listen_address: String,
    /// Port 0 binds an ephemeral port, see [`crate::push::PushTarget::local_addr`].
    pub http_listen_port: u16,
    pub http_path: String,
    pub max_request_content_length: usize,
    /// How long in-flight requests may take to finish once the target is stopped, in seconds
    pub graceful_shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            http_listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            http_listen_port: DEFAULT_LISTEN_PORT,
            http_path: DEFAULT_PUSH_PATH.to_string(),
            max_request_content_length: DEFAULT_MAX_REQUEST_CONTENT_LENGTH,
            graceful_shutdown_timeout_secs: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}

impl ServerConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.http_listen_address, self.http_listen_port)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }
}

/// Configuration of one target. Immutable once the target is created.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub job_name: String,
    pub project_id: String,
    /// Subscription id, only used by pull targets.
    pub subscription: String,
    pub subscription_type: SubscriptionType,
    /// Static labels added to every entry.
    pub labels: LabelSet,
    /// Use the publish time of the message instead of the time it was received.
    pub use_incoming_timestamp: bool,
    pub relabel_configs: Vec<RelabelConfig>,
    /// Only used by push targets.
    pub server: ServerConfig,
}

impl TargetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some((name, _)) = self.labels.iter().find(|(name, _)| !is_valid_label_name(name)) {
            return Err(ConfigError::InvalidLabelName(name.to_string()));
        }
        match self.subscription_type {
            SubscriptionType::Pull => {
                if self.project_id.is_empty() {
                    return Err(ConfigError::MissingField("project_id"));
                }
                if self.subscription.is_empty() {
                    return Err(ConfigError::MissingField("subscription"));
                }
            }
            SubscriptionType::Push => {
                if !is_valid_metric_name(&self.push_metric_namespace()) {
                    return Err(ConfigError::InvalidJobName(self.job_name.clone()));
                }
                if !self.server.http_path.starts_with('/') {
                    return Err(ConfigError::InvalidPath(self.server.http_path.clone()));
                }
            }
        }
        Ok(())
    }

    /// Namespace the push server's metrics would be registered under. The job name has to
    /// keep it a valid metric name so targets never collide in a shared registry.
    pub fn push_metric_namespace(&self) -> String {
        format!("{PUSH_METRIC_NAMESPACE_PREFIX}{}", self.job_name)
    }

    /// Identity used to partition the metrics of this target.
    pub fn metrics_key(&self) -> &str {
        match self.subscription_type {
            SubscriptionType::Pull => &self.project_id,
            SubscriptionType::Push => &self.job_name,
        }
    }

    /// Builds a push target configuration from `GCPLOG_*` environment variables.
    pub fn from_env() -> Result<TargetConfig, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<TargetConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut server = ServerConfig::default();
        if let Some(address) = lookup("GCPLOG_LISTEN_ADDRESS") {
            server.http_listen_address = address;
        }
        if let Some(port) = lookup("GCPLOG_LISTEN_PORT") {
            server.http_listen_port = port.parse().map_err(|e| ConfigError::InvalidValue {
                name: "GCPLOG_LISTEN_PORT",
                reason: format!("{e}"),
            })?;
        }
        if let Some(path) = lookup("GCPLOG_PUSH_PATH") {
            server.http_path = path;
        }
        if let Some(length) = lookup("GCPLOG_MAX_REQUEST_CONTENT_LENGTH") {
            server.max_request_content_length =
                length.parse().map_err(|e| ConfigError::InvalidValue {
                    name: "GCPLOG_MAX_REQUEST_CONTENT_LENGTH",
                    reason: format!("{e}"),
                })?;
        }

        let relabel_configs = match lookup("GCPLOG_RELABEL_CONFIGS") {
            Some(json) => serde_json::from_str(&json).map_err(|e| ConfigError::InvalidValue {
                name: "GCPLOG_RELABEL_CONFIGS",
                reason: e.to_string(),
            })?,
            None => Vec::new(),
        };

        let config = TargetConfig {
            job_name: lookup("GCPLOG_JOB_NAME").unwrap_or_else(|| "gcplog".to_string()),
            project_id: lookup("GCPLOG_PROJECT_ID").unwrap_or_default(),
            subscription: String::new(),
            subscription_type: SubscriptionType::Push,
            labels: lookup("GCPLOG_LABELS")
                .map(|labels| parse_labels(&labels))
                .unwrap_or_default(),
            use_incoming_timestamp: lookup("GCPLOG_USE_INCOMING_TIMESTAMP")
                .map(|val| val.to_lowercase() == "true")
                .unwrap_or(false),
            relabel_configs,
            server,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Parses `key:value` pairs separated by spaces or commas. Malformed pairs are skipped.
pub fn parse_labels(env_labels: &str) -> LabelSet {
    let normalized = env_labels.replace(',', " ");
    normalized
        .split_whitespace()
        .filter_map(|kv| kv.split_once(':'))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty() && !v.contains(':'))
        .collect()
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
