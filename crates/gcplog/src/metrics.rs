// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counters describing what the targets accept and reject.
//!
//! Targets never register anything globally: they record through a
//! [`MetricsRecorder`] handed to them, and [`PrometheusMetrics`] registers its
//! collectors into a registry owned by the caller.

use std::time::{SystemTime, UNIX_EPOCH};

use prometheus::{GaugeVec, IntCounterVec, Opts, Registry};

/// Why a message did not become an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// The request body could not be read.
    Read,
    /// The request body is not a valid push payload.
    Decode,
    Malformed,
    Dropped,
    /// The entry handler refused the entry.
    Sink,
    /// The subscription stopped delivering messages.
    Subscription,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Read => "read",
            FailureReason::Decode => "decode",
            FailureReason::Malformed => "malformed",
            FailureReason::Dropped => "dropped",
            FailureReason::Sink => "sink",
            FailureReason::Subscription => "subscription",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait MetricsRecorder: Send + Sync {
    /// An entry was submitted to the handler.
    fn entry_accepted(&self, target: &str);
    fn entry_failed(&self, target: &str, reason: FailureReason);
    /// Sets the last-success-scrape gauge of a subscription to the current time.
    fn mark_last_success_scrape(&self, project: &str, subscription: &str);
}

/// Recorder that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn entry_accepted(&self, _target: &str) {}
    fn entry_failed(&self, _target: &str, _reason: FailureReason) {}
    fn mark_last_success_scrape(&self, _project: &str, _subscription: &str) {}
}

#[derive(Clone)]
pub struct PrometheusMetrics {
    entries: IntCounterVec,
    errors: IntCounterVec,
    last_success_scrape: GaugeVec,
}

impl PrometheusMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let entries = IntCounterVec::new(
            Opts::new(
                "gcplog_target_entries_total",
                "Number of log entries submitted by the Pub/Sub targets",
            ),
            &["target"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new(
                "gcplog_target_errors_total",
                "Number of Pub/Sub messages that could not be turned into log entries",
            ),
            &["target", "reason"],
        )?;
        let last_success_scrape = GaugeVec::new(
            Opts::new(
                "gcplog_target_last_success_scrape",
                "Unix timestamp of the last time a subscription was reported",
            ),
            &["project", "subscription"],
        )?;

        registry.register(Box::new(entries.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(last_success_scrape.clone()))?;

        Ok(PrometheusMetrics {
            entries,
            errors,
            last_success_scrape,
        })
    }

    pub fn entries(&self, target: &str) -> u64 {
        self.entries.with_label_values(&[target]).get()
    }

    pub fn errors(&self, target: &str, reason: FailureReason) -> u64 {
        self.errors.with_label_values(&[target, reason.as_str()]).get()
    }

    pub fn last_success_scrape(&self, project: &str, subscription: &str) -> f64 {
        self.last_success_scrape
            .with_label_values(&[project, subscription])
            .get()
    }
}

impl MetricsRecorder for PrometheusMetrics {
    fn entry_accepted(&self, target: &str) {
        self.entries.with_label_values(&[target]).inc();
    }

    fn entry_failed(&self, target: &str, reason: FailureReason) {
        self.errors
            .with_label_values(&[target, reason.as_str()])
            .inc();
    }

    fn mark_last_success_scrape(&self, project: &str, subscription: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        self.last_success_scrape
            .with_label_values(&[project, subscription])
            .set(now);
    }
}
