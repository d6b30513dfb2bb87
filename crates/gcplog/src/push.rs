// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Target receiving messages from a Pub/Sub push subscription.
//!
//! Every request carries exactly one message. The response is only sent once the
//! entry has been accepted by the handler, so a slow pipeline slows down the
//! rate at which Pub/Sub pushes. Failed requests are answered with `400` and are
//! redelivered or dropped according to the subscription's own retry policy.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Body;
use hyper::service::service_fn;
use hyper::{http, Method, Request, StatusCode};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{SubscriptionType, TargetConfig};
use crate::entry::LabelSet;
use crate::errors::{ConfigError, TargetError, TranslationError};
use crate::handler::EntryHandler;
use crate::http_utils::{
    empty_response, log_and_create_http_response, verify_request_content_length, HttpResponse,
};
use crate::metrics::{FailureReason, MetricsRecorder};
use crate::translate::{translate, PushPayload};

/// Header carrying the tenant the pushed logs belong to.
pub const TENANT_ID_HEADER: &str = "X-Scope-OrgID";

/// Per-request logic of the push endpoint, shared by every connection.
struct PushService {
    config: Arc<TargetConfig>,
    handler: Arc<dyn EntryHandler>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl PushService {
    async fn route<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if req.uri().path() != self.config.server.http_path {
            return empty_response(StatusCode::NOT_FOUND);
        }
        if req.method() != Method::POST {
            return empty_response(StatusCode::METHOD_NOT_ALLOWED);
        }
        self.push(req).await
    }

    fn reject(
        &self,
        reason: FailureReason,
        message: &str,
        status: StatusCode,
    ) -> http::Result<HttpResponse> {
        self.metrics.entry_failed(self.config.metrics_key(), reason);
        log_and_create_http_response(message, status)
    }

    async fn push<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let max_length = self.config.server.max_request_content_length;

        if let Some((message, status)) = verify_request_content_length(
            &parts.headers,
            max_length,
            "failed to read incoming gcp push request",
        ) {
            return self.reject(FailureReason::Read, &message, status);
        }

        let body = match Limited::new(body, max_length).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return self.reject(
                    FailureReason::Read,
                    &format!("failed to read incoming gcp push request: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        let payload: PushPayload = match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(e) => {
                return self.reject(
                    FailureReason::Decode,
                    &format!("failed to unmarshal gcp push request: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        let tenant_id = parts
            .headers
            .get(TENANT_ID_HEADER)
            .and_then(|value| value.to_str().ok());
        let entry = match payload
            .into_envelope()
            .and_then(|envelope| translate(&envelope, &self.config, tenant_id))
        {
            Ok(entry) => entry,
            Err(e) => {
                let reason = match e {
                    TranslationError::Malformed(_) => FailureReason::Malformed,
                    TranslationError::Dropped => FailureReason::Dropped,
                };
                return self.reject(
                    reason,
                    &format!("failed to translate gcp push request: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        debug!("Received line: {}", entry.line());

        if let Err(e) = self.handler.submit(entry).await {
            return self.reject(
                FailureReason::Sink,
                &format!("failed to submit gcp push entry: {e}"),
                StatusCode::SERVICE_UNAVAILABLE,
            );
        }
        self.metrics.entry_accepted(self.config.metrics_key());
        empty_response(StatusCode::NO_CONTENT)
    }
}

pub struct PushTarget {
    config: Arc<TargetConfig>,
    handler: Arc<dyn EntryHandler>,
    local_addr: SocketAddr,
    cancel_token: CancellationToken,
    server_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PushTarget {
    /// Binds the configured address and starts serving the push endpoint.
    pub async fn new(
        config: Arc<TargetConfig>,
        handler: Arc<dyn EntryHandler>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Result<PushTarget, TargetError> {
        if config.subscription_type != SubscriptionType::Push {
            return Err(ConfigError::InvalidValue {
                name: "subscription_type",
                reason: "push target requires a push subscription".to_string(),
            }
            .into());
        }
        config.validate()?;

        let address = config.server.listen_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| TargetError::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| TargetError::Bind {
            address: address.clone(),
            source,
        })?;

        info!(
            "Starting gcp push target {} on {}{}",
            config.job_name, local_addr, config.server.http_path
        );

        let cancel_token = CancellationToken::new();
        let service = Arc::new(PushService {
            config: Arc::clone(&config),
            handler: Arc::clone(&handler),
            metrics,
        });
        let server_handle = tokio::spawn(serve(
            listener,
            service,
            cancel_token.clone(),
            config.server.graceful_shutdown_timeout(),
        ));

        Ok(PushTarget {
            config,
            handler,
            local_addr,
            cancel_token,
            server_handle: Mutex::new(Some(server_handle)),
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn labels(&self) -> &LabelSet {
        &self.config.labels
    }

    pub fn details(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("job".to_string(), self.config.job_name.clone()),
            ("listen_address".to_string(), self.local_addr.to_string()),
            ("path".to_string(), self.config.server.http_path.clone()),
        ])
    }

    /// Stops accepting connections, waits for in-flight requests, then stops the handler.
    pub async fn stop(&self) -> Result<(), TargetError> {
        let mut server_handle = self.server_handle.lock().await;
        let Some(handle) = server_handle.take() else {
            return Ok(());
        };
        info!("Stopping gcp push target {}", self.config.job_name);
        self.cancel_token.cancel();
        let result = handle.await;
        self.handler.stop();
        result.map_err(|e| TargetError::Join(e.to_string()))
    }
}

impl Drop for PushTarget {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn serve(
    listener: TcpListener,
    service: Arc<PushService>,
    cancel_token: CancellationToken,
    graceful_shutdown_timeout: Duration,
) {
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = JoinSet::new();

    loop {
        let conn = tokio::select! {
            _ = cancel_token.cancelled() => break,
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("gcp push target shutdown with error: {e}");
                    break;
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    // Don't kill server on panic - log and continue
                    error!("Connection handler panicked: {:?}", e);
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
        };

        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let service = Arc::clone(&service);
        let cancel_token = cancel_token.clone();
        joinset.spawn(async move {
            let connection = server.serve_connection(
                conn,
                service_fn(move |req| {
                    let service = Arc::clone(&service);
                    async move { service.route(req).await }
                }),
            );
            tokio::pin!(connection);
            let result = tokio::select! {
                result = connection.as_mut() => result,
                _ = cancel_token.cancelled() => {
                    connection.as_mut().graceful_shutdown();
                    connection.await
                }
            };
            if let Err(e) = result {
                debug!("Connection error: {e}");
            }
        });
    }
    drop(listener);

    let drained = tokio::time::timeout(graceful_shutdown_timeout, async {
        while joinset.join_next().await.is_some() {}
    })
    .await
    .is_ok();
    if !drained {
        warn!(
            "In-flight gcp push requests did not finish within {:?}, aborting them",
            graceful_shutdown_timeout
        );
        joinset.shutdown().await;
    }
}
