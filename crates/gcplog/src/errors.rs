// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for translation, submission, subscriptions and target lifecycle.

/// A message that can never become an [`crate::entry::Entry`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TranslationError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message dropped by relabeling")]
    Dropped,
}

/// Failure to hand an entry to the downstream handler.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("entry handler is stopped")]
    Stopped,
}

/// The subscription could not be opened or stopped delivering messages.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("failed to connect to project {project}: {reason}")]
    Connect { project: String, reason: String },
    #[error("subscription {0} not found")]
    NotFound(String),
    #[error("receive failed: {0}")]
    Receive(String),
}

/// Invalid target configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required for pull subscriptions")]
    MissingField(&'static str),
    #[error("invalid job name {0:?}: must be usable as a metric namespace")]
    InvalidJobName(String),
    #[error("invalid label name {0:?}")]
    InvalidLabelName(String),
    #[error("invalid push path {0:?}: must start with '/'")]
    InvalidPath(String),
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

/// Errors surfaced while creating or stopping a target.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind push listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("background task failed: {0}")]
    Join(String),
}
