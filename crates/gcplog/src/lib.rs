// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Targets ingesting log messages delivered by a managed Pub/Sub service.
//!
//! Two ingestion modes are provided behind one facade ([`target::Target`]):
//! a push target serving an HTTP endpoint the Pub/Sub push subscription posts
//! to, and a pull target consuming a subscription through a
//! [`pull::SubscriptionClient`]. Both translate messages into [`entry::Entry`]
//! values and submit them to an [`handler::EntryHandler`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod entry;
pub mod errors;
pub mod handler;
pub mod http_utils;
pub mod metrics;
pub mod pull;
pub mod push;
pub mod relabel;
pub mod target;
pub mod translate;
