// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Target consuming a Pub/Sub pull subscription.
//!
//! A [`SubscriptionClient`] streams messages into a [`Delivery`]. The delivery is a
//! zero-buffer handoff to a single consumer task: the client is only released once
//! the consumer has taken the message, so a blocked entry handler stops the client
//! from pulling more. Every message is acknowledged after it was handled, including
//! messages that could not be translated.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{SubscriptionType, TargetConfig};
use crate::entry::LabelSet;
use crate::errors::{ConfigError, SubscriptionError, TargetError, TranslationError};
use crate::handler::EntryHandler;
use crate::metrics::{FailureReason, MetricsRecorder};
use crate::translate::{translate, Envelope};

/// How long `stop` waits for the subscription client to return once cancelled.
pub const RECEIVE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const PULL_TASKS: usize = 2;

/// Settles a message with the transport it was received from.
pub trait Acker: Send {
    fn ack(self: Box<Self>);
    /// Asks the transport to redeliver the message.
    fn nack(self: Box<Self>);
}

/// A message pulled from a subscription, along with the capability to settle it.
///
/// `ack` and `nack` consume the message. A message dropped without being settled
/// is nacked.
pub struct ReceivedMessage {
    envelope: Envelope,
    acker: Option<Box<dyn Acker>>,
}

impl ReceivedMessage {
    pub fn new(envelope: Envelope, acker: impl Acker + 'static) -> Self {
        ReceivedMessage {
            envelope,
            acker: Some(Box::new(acker)),
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.ack();
        }
    }

    pub fn nack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack();
        }
    }
}

impl Drop for ReceivedMessage {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.nack();
        }
    }
}

impl std::fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("message_id", &self.envelope.message_id)
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

type Handoff = (ReceivedMessage, oneshot::Sender<()>);

/// Sending side of the handoff between a subscription client and the consumer task.
#[derive(Clone)]
pub struct Delivery {
    tx: mpsc::Sender<Handoff>,
    cancel: CancellationToken,
}

impl Delivery {
    fn new(cancel: CancellationToken) -> (Self, mpsc::Receiver<Handoff>) {
        let (tx, rx) = mpsc::channel(1);
        (Delivery { tx, cancel }, rx)
    }

    /// Hands `message` to the consumer and waits until it has been taken.
    ///
    /// Returns `false` when the target is cancelled first. The message is then
    /// nacked, either right away or once the consumer is gone.
    pub async fn deliver(&self, message: ReceivedMessage) -> bool {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.tx.reserve() => permit.ok(),
        };
        let Some(permit) = permit else {
            message.nack();
            return false;
        };

        let (taken_tx, taken_rx) = oneshot::channel();
        permit.send((message, taken_tx));
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            taken = taken_rx => taken.is_ok(),
        }
    }
}

/// A subscription opened for one project.
#[async_trait]
pub trait SubscriptionClient: Send + Sync {
    /// Streams messages of `subscription` into `delivery` until `cancel` fires or the
    /// subscription fails. `delivery` may be used from several tasks at once.
    async fn receive(
        &self,
        subscription: &str,
        cancel: CancellationToken,
        delivery: Delivery,
    ) -> Result<(), SubscriptionError>;
}

/// Creates subscription clients.
#[async_trait]
pub trait SubscriptionConnector: Send + Sync {
    async fn connect(
        &self,
        project_id: &str,
    ) -> Result<Arc<dyn SubscriptionClient>, SubscriptionError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PullState {
    /// The receive and consume tasks have not both started yet.
    Created,
    /// Both tasks are running.
    Running,
    /// Cancellation was issued, by `stop` or because the subscription failed.
    Cancelling,
    Stopped,
}

struct PullTasks {
    receive: JoinHandle<()>,
    consume: JoinHandle<()>,
}

pub struct PullTarget {
    config: Arc<TargetConfig>,
    handler: Arc<dyn EntryHandler>,
    cancel_token: CancellationToken,
    active_tasks: Arc<AtomicUsize>,
    stopped: AtomicBool,
    tasks: Mutex<Option<PullTasks>>,
}

impl PullTarget {
    /// Starts receiving from the configured subscription through `client`.
    pub fn new(
        config: Arc<TargetConfig>,
        handler: Arc<dyn EntryHandler>,
        metrics: Arc<dyn MetricsRecorder>,
        client: Arc<dyn SubscriptionClient>,
    ) -> Result<PullTarget, TargetError> {
        if config.subscription_type != SubscriptionType::Pull {
            return Err(ConfigError::InvalidValue {
                name: "subscription_type",
                reason: "pull target requires a pull subscription".to_string(),
            }
            .into());
        }
        config.validate()?;

        info!(
            "Starting gcp pull target on {}/{}",
            config.project_id, config.subscription
        );

        let cancel_token = CancellationToken::new();
        let active_tasks = Arc::new(AtomicUsize::new(0));
        let (delivery, rx) = Delivery::new(cancel_token.clone());

        let consume = tokio::spawn(consume(
            rx,
            Arc::clone(&config),
            Arc::clone(&handler),
            Arc::clone(&metrics),
            cancel_token.clone(),
            Arc::clone(&active_tasks),
        ));
        let receive = tokio::spawn(receive(
            client,
            Arc::clone(&config),
            metrics,
            delivery,
            cancel_token.clone(),
            Arc::clone(&active_tasks),
        ));

        Ok(PullTarget {
            config,
            handler,
            cancel_token,
            active_tasks,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Some(PullTasks { receive, consume })),
        })
    }

    pub fn state(&self) -> PullState {
        if self.stopped.load(Ordering::Acquire) {
            PullState::Stopped
        } else if self.cancel_token.is_cancelled() {
            PullState::Cancelling
        } else if self.active_tasks.load(Ordering::Acquire) >= PULL_TASKS {
            PullState::Running
        } else {
            PullState::Created
        }
    }

    pub fn labels(&self) -> &LabelSet {
        &self.config.labels
    }

    pub fn details(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("project_id".to_string(), self.config.project_id.clone()),
            ("subscription".to_string(), self.config.subscription.clone()),
        ])
    }

    /// Cancels the subscription, waits for both tasks, then stops the handler.
    pub async fn stop(&self) -> Result<(), TargetError> {
        let mut tasks = self.tasks.lock().await;
        let Some(PullTasks {
            mut receive,
            consume,
        }) = tasks.take()
        else {
            return Ok(());
        };
        info!(
            "Stopping gcp pull target on {}/{}",
            self.config.project_id, self.config.subscription
        );
        self.cancel_token.cancel();

        let consumed = consume.await;
        let received = match tokio::time::timeout(RECEIVE_SHUTDOWN_TIMEOUT, &mut receive).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Subscription client did not return within {:?}, aborting it",
                    RECEIVE_SHUTDOWN_TIMEOUT
                );
                receive.abort();
                Ok(())
            }
        };

        self.handler.stop();
        self.stopped.store(true, Ordering::Release);
        consumed
            .and(received)
            .map_err(|e| TargetError::Join(e.to_string()))
    }
}

impl Drop for PullTarget {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn receive(
    client: Arc<dyn SubscriptionClient>,
    config: Arc<TargetConfig>,
    metrics: Arc<dyn MetricsRecorder>,
    delivery: Delivery,
    cancel_token: CancellationToken,
    active_tasks: Arc<AtomicUsize>,
) {
    active_tasks.fetch_add(1, Ordering::AcqRel);
    if let Err(e) = client
        .receive(&config.subscription, cancel_token.clone(), delivery)
        .await
    {
        error!(
            "failed to receive pubsub messages from {}/{}: {e}",
            config.project_id, config.subscription
        );
        metrics.entry_failed(config.metrics_key(), FailureReason::Subscription);
        metrics.mark_last_success_scrape(&config.project_id, &config.subscription);
    }
    cancel_token.cancel();
}

async fn consume(
    mut rx: mpsc::Receiver<Handoff>,
    config: Arc<TargetConfig>,
    handler: Arc<dyn EntryHandler>,
    metrics: Arc<dyn MetricsRecorder>,
    cancel_token: CancellationToken,
    active_tasks: Arc<AtomicUsize>,
) {
    active_tasks.fetch_add(1, Ordering::AcqRel);
    let target = config.metrics_key();
    loop {
        let (message, taken) = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            next = rx.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };
        // The client may have given up on this message already.
        let _ = taken.send(());

        let entry = match translate(message.envelope(), &config, None) {
            Ok(entry) => entry,
            Err(e) => {
                let reason = match e {
                    TranslationError::Malformed(_) => FailureReason::Malformed,
                    TranslationError::Dropped => FailureReason::Dropped,
                };
                warn!(
                    "failed to translate gcp pull message {}: {e}",
                    message.envelope().message_id
                );
                metrics.entry_failed(target, reason);
                message.ack();
                continue;
            }
        };

        let submitted = tokio::select! {
            _ = cancel_token.cancelled() => {
                message.nack();
                break;
            }
            submitted = handler.submit(entry) => submitted,
        };
        match submitted {
            Ok(()) => {
                message.ack();
                metrics.entry_accepted(target);
            }
            Err(e) => {
                warn!("failed to submit gcp pull entry: {e}");
                metrics.entry_failed(target, FailureReason::Sink);
                message.nack();
            }
        }
    }
    debug!("gcp pull consumer exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::handler::ChannelHandler;
    use crate::metrics::PrometheusMetrics;
    use bytes::Bytes;
    use prometheus::Registry;
    use time::macros::datetime;

    #[derive(Clone, Default)]
    struct Settlements {
        acks: Arc<AtomicUsize>,
        nacks: Arc<AtomicUsize>,
    }

    impl Settlements {
        fn acks(&self) -> usize {
            self.acks.load(Ordering::SeqCst)
        }

        fn nacks(&self) -> usize {
            self.nacks.load(Ordering::SeqCst)
        }
    }

    impl Acker for Settlements {
        fn ack(self: Box<Self>) {
            self.acks.fetch_add(1, Ordering::SeqCst);
        }

        fn nack(self: Box<Self>) {
            self.nacks.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedClient {
        messages: std::sync::Mutex<Vec<ReceivedMessage>>,
        error: Option<&'static str>,
        returned_deliveries: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SubscriptionClient for ScriptedClient {
        async fn receive(
            &self,
            _subscription: &str,
            cancel: CancellationToken,
            delivery: Delivery,
        ) -> Result<(), SubscriptionError> {
            let messages = std::mem::take(&mut *self.messages.lock().unwrap());
            for message in messages {
                delivery.deliver(message).await;
                self.returned_deliveries.fetch_add(1, Ordering::SeqCst);
            }
            if let Some(error) = self.error {
                return Err(SubscriptionError::Receive(error.to_string()));
            }
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn message(data: &'static [u8], settlements: &Settlements) -> ReceivedMessage {
        ReceivedMessage::new(
            Envelope {
                data: Bytes::from_static(data),
                message_id: "1".to_string(),
                publish_time: Some(datetime!(2024-01-01 00:00:00 UTC)),
                ..Default::default()
            },
            settlements.clone(),
        )
    }

    fn pull_config() -> TargetConfig {
        TargetConfig {
            project_id: "my-project".to_string(),
            subscription: "logs".to_string(),
            labels: [("job", "gcplog")].into_iter().collect(),
            use_incoming_timestamp: true,
            ..Default::default()
        }
    }

    struct Started {
        target: PullTarget,
        rx: mpsc::Receiver<Entry>,
        metrics: PrometheusMetrics,
        returned_deliveries: Arc<AtomicUsize>,
    }

    fn start_with(
        config: TargetConfig,
        messages: Vec<ReceivedMessage>,
        error: Option<&'static str>,
        capacity: usize,
    ) -> Started {
        let (handler, rx) = ChannelHandler::new(capacity);
        let metrics = PrometheusMetrics::new(&Registry::new()).unwrap();
        let returned_deliveries = Arc::new(AtomicUsize::new(0));
        let client = ScriptedClient {
            messages: std::sync::Mutex::new(messages),
            error,
            returned_deliveries: Arc::clone(&returned_deliveries),
        };
        let target = PullTarget::new(
            Arc::new(config),
            Arc::new(handler),
            Arc::new(metrics.clone()),
            Arc::new(client),
        )
        .unwrap();
        Started {
            target,
            rx,
            metrics,
            returned_deliveries,
        }
    }

    fn start(
        messages: Vec<ReceivedMessage>,
        error: Option<&'static str>,
        capacity: usize,
    ) -> (PullTarget, mpsc::Receiver<Entry>, PrometheusMetrics) {
        let started = start_with(pull_config(), messages, error, capacity);
        (started.target, started.rx, started.metrics)
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_message_is_submitted_then_acked() {
        let settlements = Settlements::default();
        let (target, mut rx, metrics) = start(vec![message(b"hello", &settlements)], None, 4);

        let entry = rx.recv().await.unwrap();
        assert_eq!(
            entry,
            Entry::new(
                [("job", "gcplog")].into_iter().collect(),
                datetime!(2024-01-01 00:00:00 UTC),
                "hello".to_string()
            )
        );
        wait_for(|| settlements.acks() == 1).await;
        wait_for(|| metrics.entries("my-project") == 1).await;
        assert_eq!(target.state(), PullState::Running);

        target.stop().await.unwrap();
        assert_eq!(settlements.acks(), 1);
        assert_eq!(settlements.nacks(), 0);
    }

    #[tokio::test]
    async fn test_malformed_message_is_acked() {
        let settlements = Settlements::default();
        let (target, mut rx, metrics) =
            start(vec![message(&[0xff, 0xfe], &settlements)], None, 4);

        wait_for(|| settlements.acks() == 1).await;
        assert_eq!(metrics.errors("my-project", FailureReason::Malformed), 1);
        target.stop().await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_message_dropped_by_relabeling_is_acked() {
        let settlements = Settlements::default();
        let mut config = pull_config();
        config.relabel_configs = serde_json::from_str(
            r#"[{"action": "drop", "source_labels": ["__gcp_message_id"], "regex": "1"}]"#,
        )
        .unwrap();
        let Started {
            target,
            mut rx,
            metrics,
            ..
        } = start_with(config, vec![message(b"hello", &settlements)], None, 4);

        wait_for(|| settlements.acks() == 1).await;
        assert_eq!(metrics.errors("my-project", FailureReason::Dropped), 1);
        assert_eq!(metrics.entries("my-project"), 0);

        target.stop().await.unwrap();
        assert_eq!(settlements.acks(), 1);
        assert_eq!(settlements.nacks(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_receive_error_cancels_target() {
        let (target, _rx, metrics) = start(Vec::new(), Some("subscription deleted"), 4);

        wait_for(|| target.state() == PullState::Cancelling).await;
        assert_eq!(metrics.errors("my-project", FailureReason::Subscription), 1);
        assert!(metrics.last_success_scrape("my-project", "logs") > 0.0);

        target.stop().await.unwrap();
        assert_eq!(target.state(), PullState::Stopped);
    }

    #[tokio::test]
    async fn test_blocked_handler_stops_delivery() {
        let settlements = Settlements::default();
        let messages = vec![
            message(b"one", &settlements),
            message(b"two", &settlements),
            message(b"three", &settlements),
        ];
        let Started {
            target,
            rx: _rx,
            returned_deliveries,
            ..
        } = start_with(pull_config(), messages, None, 1);

        // "one" fills the handler, "two" is taken and blocks in submit, "three" waits in deliver.
        wait_for(|| settlements.acks() == 1).await;
        wait_for(|| returned_deliveries.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(returned_deliveries.load(Ordering::SeqCst), 2);
        assert_eq!(settlements.acks(), 1);
        assert_eq!(settlements.nacks(), 0);

        target.stop().await.unwrap();
        assert_eq!(settlements.acks(), 1);
        assert_eq!(settlements.nacks(), 2);
    }

    #[tokio::test]
    async fn test_running_once_both_tasks_started() {
        let (target, _rx, _metrics) = start(Vec::new(), None, 1);
        // The current-thread test runtime has not polled either task yet.
        assert_eq!(target.state(), PullState::Created);
        wait_for(|| target.state() == PullState::Running).await;
        assert_eq!(target.active_tasks.load(Ordering::SeqCst), PULL_TASKS);
        target.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (target, mut rx, _metrics) = start(Vec::new(), None, 1);
        target.stop().await.unwrap();
        target.stop().await.unwrap();
        assert_eq!(target.state(), PullState::Stopped);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_dropped_message_is_nacked() {
        let settlements = Settlements::default();
        drop(message(b"hello", &settlements));
        assert_eq!(settlements.nacks(), 1);

        message(b"hello", &settlements).ack();
        assert_eq!(settlements.acks(), 1);
        assert_eq!(settlements.nacks(), 1);
    }

    #[tokio::test]
    async fn test_deliver_after_cancel_nacks() {
        let settlements = Settlements::default();
        let cancel = CancellationToken::new();
        let (delivery, _rx) = Delivery::new(cancel.clone());
        cancel.cancel();
        assert!(!delivery.deliver(message(b"hello", &settlements)).await);
        assert_eq!(settlements.nacks(), 1);
    }
}
