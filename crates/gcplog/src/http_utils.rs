// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    header,
    http::{self, HeaderMap},
    Response, StatusCode,
};
use tracing::{debug, warn};

pub type HttpResponse = Response<Full<Bytes>>;

/// Does two things:
/// 1. Logs the given message. A success status code (within 200-299) will cause a debug log to be
///    written, otherwise a warning will be written.
/// 2. Returns the given message as the plain-text body of a response with the given status code.
pub fn log_and_create_http_response(message: &str, status: StatusCode) -> http::Result<HttpResponse> {
    if status.is_success() {
        debug!("{message}");
    } else {
        warn!("{message}");
    }
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.to_string())))
}

/// Returns an empty response with the given status code.
pub fn empty_response(status: StatusCode) -> http::Result<HttpResponse> {
    Response::builder().status(status).body(Full::new(Bytes::new()))
}

/// Takes a request's header map, and verifies that the "content-length" header, when present,
/// is valid and not greater than the given max_content_length. Chunked requests are accepted
/// here and bounded while the body is read.
///
/// Will return None if no issues are found. Otherwise returns the error message (with the given
/// prefix) and the status code to respond with.
pub fn verify_request_content_length(
    header_map: &HeaderMap,
    max_content_length: usize,
    error_message_prefix: &str,
) -> Option<(String, StatusCode)> {
    let content_length_header = header_map.get(header::CONTENT_LENGTH)?;
    let content_length = match content_length_header
        .to_str()
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
    {
        Some(res) => res,
        None => {
            return Some((
                format!("{error_message_prefix}: Invalid Content-Length header"),
                StatusCode::BAD_REQUEST,
            ));
        }
    };
    if content_length > max_content_length {
        return Some((
            format!("{error_message_prefix}: Payload too large"),
            StatusCode::BAD_REQUEST,
        ));
    }
    None
}
