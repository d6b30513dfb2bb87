// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock subscription clients for testing the pull target

use async_trait::async_trait;
use bytes::Bytes;
use gcplog::errors::SubscriptionError;
use gcplog::pull::{Acker, Delivery, ReceivedMessage, SubscriptionClient, SubscriptionConnector};
use gcplog::translate::Envelope;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    Ack(String),
    Nack(String),
}

/// Records how every message it was attached to got settled
#[derive(Clone, Default)]
pub struct SettlementLog(Arc<Mutex<Vec<Settlement>>>);

#[allow(dead_code)]
impl SettlementLog {
    pub fn acker(&self, message_id: &str) -> RecordingAcker {
        RecordingAcker {
            message_id: message_id.to_string(),
            log: self.clone(),
        }
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.0.lock().unwrap().clone()
    }

    pub fn acks(&self) -> usize {
        self.settlements()
            .iter()
            .filter(|s| matches!(s, Settlement::Ack(_)))
            .count()
    }

    fn push(&self, settlement: Settlement) {
        self.0.lock().unwrap().push(settlement);
    }
}

pub struct RecordingAcker {
    message_id: String,
    log: SettlementLog,
}

impl Acker for RecordingAcker {
    fn ack(self: Box<Self>) {
        self.log.push(Settlement::Ack(self.message_id.clone()));
    }

    fn nack(self: Box<Self>) {
        self.log.push(Settlement::Nack(self.message_id.clone()));
    }
}

#[allow(dead_code)]
pub fn received_message(
    data: &str,
    message_id: &str,
    publish_time: OffsetDateTime,
    log: &SettlementLog,
) -> ReceivedMessage {
    ReceivedMessage::new(
        Envelope {
            data: Bytes::from(data.to_string()),
            message_id: message_id.to_string(),
            publish_time: Some(publish_time),
            ..Default::default()
        },
        log.acker(message_id),
    )
}

/// Subscription client delivering a fixed batch of messages, each from its own task
pub struct MockSubscriptionClient {
    messages: Mutex<Vec<ReceivedMessage>>,
    subscriptions: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl MockSubscriptionClient {
    pub fn new(messages: Vec<ReceivedMessage>) -> Self {
        MockSubscriptionClient {
            messages: Mutex::new(messages),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubscriptionClient for MockSubscriptionClient {
    async fn receive(
        &self,
        subscription: &str,
        cancel: CancellationToken,
        delivery: Delivery,
    ) -> Result<(), SubscriptionError> {
        self.subscriptions
            .lock()
            .unwrap()
            .push(subscription.to_string());
        let messages = std::mem::take(&mut *self.messages.lock().unwrap());

        let mut deliveries = JoinSet::new();
        for message in messages {
            let delivery = delivery.clone();
            deliveries.spawn(async move { delivery.deliver(message).await });
        }
        while deliveries.join_next().await.is_some() {}

        cancel.cancelled().await;
        Ok(())
    }
}

/// Connector handing out the same client for every project
pub struct MockConnector {
    client: Arc<MockSubscriptionClient>,
    projects: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl MockConnector {
    pub fn new(client: Arc<MockSubscriptionClient>) -> Self {
        MockConnector {
            client,
            projects: Mutex::new(Vec::new()),
        }
    }

    pub fn projects(&self) -> Vec<String> {
        self.projects.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubscriptionConnector for MockConnector {
    async fn connect(
        &self,
        project_id: &str,
    ) -> Result<Arc<dyn SubscriptionClient>, SubscriptionError> {
        self.projects.lock().unwrap().push(project_id.to_string());
        let client: Arc<dyn SubscriptionClient> = self.client.clone();
        Ok(client)
    }
}
