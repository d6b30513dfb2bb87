// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};

use prometheus::{Encoder, Registry, TextEncoder};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use gcplog::{
    config::TargetConfig,
    entry::Entry,
    handler::ChannelHandler,
    metrics::PrometheusMetrics,
    push::PushTarget,
    target::Target,
};

const ENTRY_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("GCPLOG_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match TargetConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error creating config on gcplog push server startup: {e}");
            return;
        }
    };

    let registry = Registry::new();
    let metrics = match PrometheusMetrics::new(&registry) {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            error!("Error registering gcplog metrics: {e}");
            return;
        }
    };

    let (handler, entries) = ChannelHandler::new(ENTRY_CHANNEL_CAPACITY);
    let writer = tokio::spawn(write_entries(entries));

    let target = match PushTarget::new(Arc::new(config), Arc::new(handler), metrics).await {
        Ok(target) => Target::Push(target),
        Err(e) => {
            error!("Error starting gcplog push target: {e}");
            return;
        }
    };
    info!("gcplog push server started: {:?}", target.details());

    wait_for_shutdown().await;

    if let Err(e) = target.stop().await {
        error!("Error stopping gcplog push target: {e}");
    }
    if let Err(e) = writer.await {
        error!("Entry writer failed: {e}");
    }

    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => debug!("Final metrics:\n{}", String::from_utf8_lossy(&buffer)),
        Err(e) => debug!("Unable to encode metrics: {e}"),
    }
    info!("gcplog push server stopped");
}

/// Writes every accepted entry to stdout as one JSON document per line.
async fn write_entries(mut entries: mpsc::Receiver<Entry>) {
    let mut stdout = tokio::io::stdout();
    while let Some(entry) = entries.recv().await {
        let mut line = match serde_json::to_vec(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!("Unable to serialize entry: {e}");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = stdout.write_all(&line).await {
            error!("Unable to write entry to stdout: {e}");
            continue;
        }
        if let Err(e) = stdout.flush().await {
            error!("Unable to flush stdout: {e}");
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Unable to listen for SIGTERM: {e}");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Unable to listen for ctrl-c: {e}");
            }
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => info!("Received ctrl-c, shutting down"),
            Err(e) => error!("Unable to listen for ctrl-c: {e}"),
        },
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received ctrl-c, shutting down"),
        Err(e) => error!("Unable to listen for ctrl-c: {e}"),
    }
}
