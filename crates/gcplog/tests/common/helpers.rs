// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use bytes::Bytes;
use gcplog::config::{SubscriptionType, TargetConfig};
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;

/// Push config listening on an ephemeral local port
#[allow(dead_code)]
pub fn push_config(job_name: &str) -> TargetConfig {
    let mut config = TargetConfig {
        job_name: job_name.to_string(),
        subscription_type: SubscriptionType::Push,
        labels: [("job", "gcp_push")].into_iter().collect(),
        ..Default::default()
    };
    config.server.http_listen_address = "127.0.0.1".to_string();
    config.server.http_listen_port = 0;
    config
}

/// Body of a push request carrying `data` (already base64 encoded)
#[allow(dead_code)]
pub fn push_body(data: &str, message_id: &str) -> Vec<u8> {
    format!(
        r#"{{"message": {{"attributes": {{"severity": "INFO"}}, "data": "{data}",
            "messageId": "{message_id}", "message_id": "{message_id}",
            "publishTime": "2024-01-01T00:00:00Z", "publish_time": "2024-01-01T00:00:00Z"}},
            "subscription": "projects/my-project/subscriptions/logs-push"}}"#
    )
    .into_bytes()
}

/// Send an HTTP request over TCP and return the status and body of the response
#[allow(dead_code)]
pub async fn send_tcp_request(
    addr: SocketAddr,
    uri: &str,
    method: &str,
    body: Option<Vec<u8>>,
    headers: &[(&str, &str)],
) -> Result<(StatusCode, String), Box<dyn std::error::Error + Send + Sync>> {
    let stream = timeout(Duration::from_secs(2), tokio::net::TcpStream::connect(addr)).await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut request_builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("Host", addr.to_string())
        .header("Content-Type", "application/json");
    for (name, value) in headers {
        request_builder = request_builder.header(*name, *value);
    }

    let body = body.unwrap_or_default();
    let request = request_builder.body(Full::new(Bytes::from(body)))?;
    let response = timeout(Duration::from_secs(2), sender.send_request(request)).await??;

    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8_lossy(&bytes).into_owned()))
}

/// Polls `condition` until it holds, panicking after two seconds
#[allow(dead_code)]
pub async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
