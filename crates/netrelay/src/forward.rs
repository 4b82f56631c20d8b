//! Upstream forwarding for the debug proxy.
//!
//! With capture on, calls go through the [`RelayClient`] and the response is
//! served from the relay's replay buffer. With capture off, upstream bytes
//! stream back untouched.

use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use netrelay::correlation::CORRELATION_HEADER;
use netrelay::RelayClient;

/// Headers that should NOT be forwarded (hop-by-hop headers).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Copy end-to-end request headers onto `builder`. `content-length` is left
/// to reqwest, which derives it from the body.
fn with_request_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &HeaderMap,
) -> reqwest::RequestBuilder {
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) || name == "content-length" {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
}

/// Start an axum response carrying the upstream status and end-to-end headers.
fn response_head(status: StatusCode, headers: &HeaderMap) -> axum::http::response::Builder {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
}

/// Attach `body` unless it is empty, so bodyless requests stay bodyless.
fn with_body(builder: reqwest::RequestBuilder, body: Bytes) -> reqwest::RequestBuilder {
    if body.is_empty() {
        builder
    } else {
        builder.body(body)
    }
}

fn upstream_error(e: &reqwest::Error, start: Instant) -> Response {
    let latency = start.elapsed().as_millis() as u64;
    if e.is_timeout() {
        tracing::error!(error = %e, latency_ms = latency, "Upstream timeout");
        return (StatusCode::GATEWAY_TIMEOUT, "upstream timeout").into_response();
    }
    tracing::error!(error = %e, latency_ms = latency, "Upstream connection error");
    (StatusCode::BAD_GATEWAY, "upstream connection error").into_response()
}

fn finish(builder: axum::http::response::Builder, body: Body) -> Response {
    builder.body(body).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to build response");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    })
}

/// Forward a request through the relay and replay the captured response.
pub async fn forward_relayed(
    client: &RelayClient,
    method: Method,
    url: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let builder = with_request_headers(with_body(client.request(method, url), body), headers);

    let upstream = match client.send(builder).await {
        Ok(resp) => resp,
        Err(e) => return upstream_error(&e, start),
    };

    tracing::info!(
        request_id = %upstream.request_id(),
        status = upstream.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "Forward complete"
    );

    let builder = response_head(upstream.status(), upstream.headers()).header(
        CORRELATION_HEADER,
        HeaderValue::from_str(upstream.request_id())
            .unwrap_or_else(|_| HeaderValue::from_static("unknown")),
    );
    finish(builder, Body::from_stream(upstream.bytes_stream()))
}

/// Forward a request without capture, streaming the upstream body verbatim.
pub async fn forward_passthrough(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let builder = with_request_headers(with_body(client.request(method, url), body), headers);

    let upstream = match builder.send().await {
        Ok(resp) => resp,
        Err(e) => return upstream_error(&e, start),
    };

    tracing::info!(
        status = upstream.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "Passthrough complete"
    );

    let builder = response_head(upstream.status(), upstream.headers());
    finish(builder, Body::from_stream(upstream.bytes_stream()))
}
