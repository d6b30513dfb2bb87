// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{SubscriptionType, TargetConfig};
use crate::entry::LabelSet;
use crate::errors::TargetError;
use crate::handler::EntryHandler;
use crate::metrics::MetricsRecorder;
use crate::pull::{PullTarget, SubscriptionConnector};
use crate::push::PushTarget;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetType {
    Gcplog,
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetType::Gcplog => f.write_str("Gcplog"),
        }
    }
}

/// A running Pub/Sub target, of either subscription type.
pub enum Target {
    Push(PushTarget),
    Pull(PullTarget),
}

impl Target {
    /// Validates `config` and starts the target it describes. `connector` is only
    /// used for pull subscriptions.
    pub async fn new(
        config: TargetConfig,
        handler: Arc<dyn EntryHandler>,
        metrics: Arc<dyn MetricsRecorder>,
        connector: &dyn SubscriptionConnector,
    ) -> Result<Target, TargetError> {
        config.validate()?;
        let config = Arc::new(config);
        match config.subscription_type {
            SubscriptionType::Push => Ok(Target::Push(
                PushTarget::new(config, handler, metrics).await?,
            )),
            SubscriptionType::Pull => {
                let client = connector.connect(&config.project_id).await?;
                Ok(Target::Pull(PullTarget::new(
                    config, handler, metrics, client,
                )?))
            }
        }
    }

    pub fn target_type(&self) -> TargetType {
        TargetType::Gcplog
    }

    pub fn labels(&self) -> &LabelSet {
        match self {
            Target::Push(target) => target.labels(),
            Target::Pull(target) => target.labels(),
        }
    }

    /// Pub/Sub targets have nothing to discover.
    pub fn discovered_labels(&self) -> LabelSet {
        LabelSet::new()
    }

    pub fn ready(&self) -> bool {
        true
    }

    pub fn details(&self) -> BTreeMap<String, String> {
        match self {
            Target::Push(target) => target.details(),
            Target::Pull(target) => target.details(),
        }
    }

    pub async fn stop(&self) -> Result<(), TargetError> {
        match self {
            Target::Push(target) => target.stop().await,
            Target::Pull(target) => target.stop().await,
        }
    }
}
