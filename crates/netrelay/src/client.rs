//! `reqwest` transport hook.
//!
//! [`RelayClient`] wraps a `reqwest::Client` and drives the relay for every
//! call it executes. The response body is read once, reported, and handed
//! back inside a [`RelayedResponse`] that replays it.

use std::time::Instant;

use bytes::Bytes;
use futures_core::Stream;
use http::{HeaderMap, StatusCode, Version};
use reqwest::Url;
use serde::de::DeserializeOwned;
use tracing::Instrument;

use crate::relay::{EventRelay, ResponseView};
use crate::replay::{ReplayBody, ReplayError};

/// Reading a relayed body failed.
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error("failed to decode body as JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A `reqwest::Client` whose calls are reported through an [`EventRelay`].
#[derive(Clone)]
pub struct RelayClient {
    client: reqwest::Client,
    relay: EventRelay,
}

impl RelayClient {
    pub fn new(client: reqwest::Client, relay: EventRelay) -> Self {
        Self { client, relay }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn relay(&self) -> &EventRelay {
        &self.relay
    }

    /// Start building a request on the wrapped client. Send it with
    /// [`RelayClient::send`] so the call is relayed.
    pub fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client.request(method, url)
    }

    pub fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.get(url)
    }

    pub fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.post(url)
    }

    /// Build and execute `builder`.
    ///
    /// A builder that fails to build never reaches the network, so no
    /// records are emitted for it.
    pub async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<RelayedResponse, reqwest::Error> {
        let request = builder.build()?;
        self.execute(request).await
    }

    /// Execute `request`, reporting its start and its end.
    ///
    /// Transport errors are reported as failure records and returned
    /// unchanged. If the returned future is dropped mid-call, the call is
    /// reported as failed.
    pub async fn execute(&self, request: reqwest::Request) -> Result<RelayedResponse, reqwest::Error> {
        let handle = self.relay.on_call_start(&request);
        let is_head = request.method() == reqwest::Method::HEAD;
        let span = netrelay_tracing::relay_call_span!(
            handle.request_id(),
            request.method(),
            request.url()
        );
        let start = Instant::now();

        async move {
            let response = match self.client.execute(request).await {
                Ok(resp) => resp,
                Err(e) => {
                    let latency = start.elapsed().as_millis() as u64;
                    tracing::Span::current().record("latency_ms", latency);
                    tracing::Span::current().record("status", 0_u16);
                    tracing::Span::current().record("failed", true);
                    if e.is_timeout() {
                        tracing::warn!(error = %e, "Relayed call timed out");
                    } else {
                        tracing::warn!(error = %e, "Relayed call failed");
                    }
                    handle.fail(&e);
                    return Err(e);
                }
            };

            let status = response.status();
            let version = response.version();
            let url = response.url().clone();
            let headers = response.headers().clone();

            let body = ReplayBody::capture(response.bytes_stream()).await;

            let latency = start.elapsed().as_millis() as u64;
            tracing::Span::current().record("latency_ms", latency);
            tracing::Span::current().record("status", status.as_u16());

            let request_id = handle.request_id().to_string();
            match body.error() {
                Some(e) => {
                    tracing::Span::current().record("failed", true);
                    tracing::warn!(error = %e, "Response body interrupted");
                    handle.fail(e);
                }
                None => {
                    let captured = (!is_head && carries_body(status)).then(|| body.captured().clone());
                    handle.succeed(ResponseView::new(status, &headers, captured));
                }
            }

            Ok(RelayedResponse {
                request_id,
                status,
                version,
                url,
                headers,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

/// Whether a response with `status` can carry a body at all.
fn carries_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// A response whose body was captured by the relay.
///
/// Mirrors the parts of `reqwest::Response` callers read; the body methods
/// replay the captured bytes, including a mid-stream failure.
#[derive(Debug)]
pub struct RelayedResponse {
    request_id: String,
    status: StatusCode,
    version: Version,
    url: Url,
    headers: HeaderMap,
    body: ReplayBody,
}

impl RelayedResponse {
    /// Identifier the call was reported under.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Length of the captured body; `None` if the body stream failed.
    pub fn content_length(&self) -> Option<u64> {
        self.body.is_complete().then(|| self.body.len() as u64)
    }

    pub fn bytes(self) -> Result<Bytes, ReplayError> {
        self.body.into_bytes()
    }

    /// Body as text; invalid UTF-8 is replaced.
    pub fn text(self) -> Result<String, ReplayError> {
        let bytes = self.body.into_bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn json<T: DeserializeOwned>(self) -> Result<T, BodyError> {
        let bytes = self.body.into_bytes()?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn bytes_stream(self) -> impl Stream<Item = Result<Bytes, ReplayError>> + Send + 'static {
        self.body.reader()
    }
}
