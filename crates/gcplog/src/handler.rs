// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The downstream side of a target: where translated entries are submitted.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::entry::Entry;
use crate::errors::HandlerError;

#[async_trait]
pub trait EntryHandler: Send + Sync {
    /// Hands `entry` to the pipeline. Waits while the pipeline applies backpressure.
    async fn submit(&self, entry: Entry) -> Result<(), HandlerError>;

    /// Releases downstream resources. Calling it more than once has no further effect.
    fn stop(&self);
}

/// Handler backed by a bounded channel. The paired receiver yields `None` once the
/// handler is stopped and every in-flight submission has completed.
pub struct ChannelHandler {
    tx: Mutex<Option<mpsc::Sender<Entry>>>,
}

impl ChannelHandler {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Entry>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            ChannelHandler {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn sender(&self) -> Option<mpsc::Sender<Entry>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EntryHandler for ChannelHandler {
    async fn submit(&self, entry: Entry) -> Result<(), HandlerError> {
        let tx = self.sender().ok_or(HandlerError::Stopped)?;
        tx.send(entry).await.map_err(|_| HandlerError::Stopped)
    }

    fn stop(&self) {
        if self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("Entry handler stopped");
        }
    }
}
