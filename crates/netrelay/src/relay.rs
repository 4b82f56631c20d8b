//! The event relay: turns call lifecycles into request/response records.
//!
//! ```text
//! on_call_start ──► RequestRecord ──► sink
//!       │
//!   CallHandle ── on_call_end(Ok) ──► ResponseRecord ──► sink
//!             ├── on_call_end(Err) ─► ResponseRecord (failure) ──► sink
//!             └── dropped ─────────► ResponseRecord (failure) ──► sink
//! ```
//!
//! `on_call_end` consumes the handle, so a call terminates at most once; the
//! `Drop` impl makes sure it terminates at least once.

use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, StatusCode};
use serde::Deserialize;

use crate::correlation;
use crate::record::{first_header, now_millis, Header, RequestRecord, ResponseRecord};
use crate::sink::ReportSink;

/// Message on the failure record of a handle dropped without `on_call_end`.
pub const DROPPED_MESSAGE: &str = "call dropped before completion";

/// Message on the failure record produced by [`AbsentBodyPolicy::Failure`].
pub const ABSENT_BODY_MESSAGE: &str = "response carried no body";

/// What to record when a response has no body at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbsentBodyPolicy {
    /// Record an empty body.
    #[default]
    Empty,
    /// Record the call as failed.
    Failure,
}

/// Which bodies end up in records, and how large they may be.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Bodies longer than this are elided; only their length is recorded.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default = "default_true")]
    pub capture_request_body: bool,

    #[serde(default = "default_true")]
    pub capture_response_body: bool,

    #[serde(default)]
    pub absent_body: AbsentBodyPolicy,
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
            capture_request_body: true,
            capture_response_body: true,
            absent_body: AbsentBodyPolicy::default(),
        }
    }
}

/// Request body as seen at call start, without consuming it.
#[derive(Debug, Clone, Copy)]
pub enum RequestBody<'a> {
    None,
    Buffered(&'a [u8]),
    /// A stream that cannot be read without taking it from the call.
    Streaming,
}

/// Read access to an outgoing call at start time.
pub trait CallRequest {
    fn method(&self) -> &str;

    fn uri(&self) -> String;

    /// Header snapshot, in order, duplicates kept.
    fn headers(&self) -> Vec<Header>;

    fn body(&self) -> RequestBody<'_>;
}

/// A call described with plain values, for hosts without `http` types.
#[derive(Debug, Clone, Default)]
pub struct CallInfo {
    pub method: String,
    pub uri: String,
    pub headers: Vec<Header>,
    pub body: Option<Bytes>,
}

impl CallRequest for CallInfo {
    fn method(&self) -> &str {
        &self.method
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn headers(&self) -> Vec<Header> {
        self.headers.clone()
    }

    fn body(&self) -> RequestBody<'_> {
        match self.body {
            Some(ref b) => RequestBody::Buffered(b),
            None => RequestBody::None,
        }
    }
}

impl CallRequest for reqwest::Request {
    fn method(&self) -> &str {
        self.method().as_str()
    }

    fn uri(&self) -> String {
        self.url().to_string()
    }

    fn headers(&self) -> Vec<Header> {
        headers_from_map(self.headers())
    }

    fn body(&self) -> RequestBody<'_> {
        match self.body() {
            None => RequestBody::None,
            Some(body) => match body.as_bytes() {
                Some([]) => RequestBody::None,
                Some(bytes) => RequestBody::Buffered(bytes),
                None => RequestBody::Streaming,
            },
        }
    }
}

impl CallRequest for http::Request<Bytes> {
    fn method(&self) -> &str {
        self.method().as_str()
    }

    fn uri(&self) -> String {
        self.uri().to_string()
    }

    fn headers(&self) -> Vec<Header> {
        headers_from_map(self.headers())
    }

    fn body(&self) -> RequestBody<'_> {
        if self.body().is_empty() {
            RequestBody::None
        } else {
            RequestBody::Buffered(self.body())
        }
    }
}

/// Snapshot a header map. Values that are not valid UTF-8 are converted
/// lossily instead of being dropped.
pub fn headers_from_map(map: &HeaderMap) -> Vec<Header> {
    map.iter()
        .map(|(name, value)| {
            let value = match value.to_str() {
                Ok(v) => v.to_string(),
                Err(_) => {
                    tracing::warn!(header = %name, "Header value is not valid UTF-8, recording lossily");
                    String::from_utf8_lossy(value.as_bytes()).into_owned()
                }
            };
            Header::new(name.as_str(), value)
        })
        .collect()
}

/// What a call produced on success.
#[derive(Debug, Clone)]
pub struct ResponseView {
    pub status: u16,
    /// Reason phrase; the canonical one for `status` when `None`.
    pub reason: Option<String>,
    pub headers: Vec<Header>,
    /// `None` when the response had no body at all.
    pub body: Option<Bytes>,
}

impl ResponseView {
    pub fn new(status: StatusCode, headers: &HeaderMap, body: Option<Bytes>) -> Self {
        Self {
            status: status.as_u16(),
            reason: None,
            headers: headers_from_map(headers),
            body,
        }
    }
}

/// Observes call lifecycles and reports them to a sink.
///
/// Cheap to clone; clones share the sink.
#[derive(Clone)]
pub struct EventRelay {
    sink: Arc<dyn ReportSink>,
    capture: Arc<CaptureConfig>,
}

impl EventRelay {
    pub fn new(sink: Arc<dyn ReportSink>, capture: CaptureConfig) -> Self {
        Self {
            sink,
            capture: Arc::new(capture),
        }
    }

    pub fn capture_config(&self) -> &CaptureConfig {
        &self.capture
    }

    /// Report the start of `call` under a freshly allocated identifier.
    pub fn on_call_start<C: CallRequest + ?Sized>(&self, call: &C) -> CallHandle {
        self.on_call_start_with_id(correlation::generate_id(), call)
    }

    /// Report the start of `call` under a caller-chosen identifier.
    pub fn on_call_start_with_id<C: CallRequest + ?Sized>(
        &self,
        request_id: impl Into<String>,
        call: &C,
    ) -> CallHandle {
        let request_id = request_id.into();
        let headers = call.headers();
        let (body, body_length, message) = self.request_body(call.body(), &headers);

        let record = RequestRecord {
            request_id: request_id.clone(),
            timestamp: now_millis(),
            method: call.method().to_string(),
            uri: call.uri(),
            headers,
            body,
            body_length,
            message,
            response_code: None,
        };

        tracing::debug!(request_id = %request_id, method = %record.method, "Call started");
        self.sink.report_request(record);

        CallHandle {
            request_id,
            started: Instant::now(),
            sink: self.sink.clone(),
            capture: self.capture.clone(),
            terminated: false,
        }
    }

    fn request_body(
        &self,
        body: RequestBody<'_>,
        headers: &[Header],
    ) -> (Option<Bytes>, Option<u64>, Option<String>) {
        match body {
            RequestBody::None => (None, None, None),
            RequestBody::Buffered(bytes) => {
                let (body, length) = elide(
                    bytes,
                    self.capture.capture_request_body,
                    self.capture.max_body_bytes,
                    Bytes::copy_from_slice,
                );
                (body, length, None)
            }
            RequestBody::Streaming => {
                let length = first_header(headers, CONTENT_LENGTH.as_str())
                    .and_then(|h| h.value.trim().parse::<u64>().ok());
                (
                    None,
                    length,
                    Some("streaming request body not captured".to_string()),
                )
            }
        }
    }
}

/// Keep `body` if capture is enabled and it fits, else only its length.
/// `keep` turns a kept body into `Bytes`, so elided bodies are never copied.
fn elide<B: AsRef<[u8]>>(
    body: B,
    enabled: bool,
    max: usize,
    keep: impl FnOnce(B) -> Bytes,
) -> (Option<Bytes>, Option<u64>) {
    let len = body.as_ref().len();
    if enabled && len <= max {
        (Some(keep(body)), None)
    } else {
        (None, Some(len as u64))
    }
}

/// Per-call bookkeeping between start and end.
///
/// Dropping a handle that was never ended reports a failure record.
pub struct CallHandle {
    request_id: String,
    started: Instant,
    sink: Arc<dyn ReportSink>,
    capture: Arc<CaptureConfig>,
    terminated: bool,
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("request_id", &self.request_id)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl CallHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Report how the call ended.
    pub fn on_call_end<E: Display>(mut self, outcome: Result<ResponseView, E>) {
        let record = match outcome {
            Ok(response) => self.response_record(response),
            Err(e) => ResponseRecord::failed(&self.request_id, e.to_string(), self.elapsed_ms()),
        };
        self.report(record);
    }

    pub fn succeed(self, response: ResponseView) {
        self.on_call_end(Ok::<_, Infallible>(response));
    }

    pub fn fail(self, error: impl Display) {
        self.on_call_end(Err::<ResponseView, _>(error));
    }

    fn report(&mut self, record: ResponseRecord) {
        // Flag first so a panicking sink cannot trigger a second report from Drop.
        self.terminated = true;
        tracing::debug!(
            request_id = %self.request_id,
            status = record.status_code,
            failed = record.is_failure(),
            "Call terminated"
        );
        self.sink.report_response(record);
    }

    fn response_record(&self, response: ResponseView) -> ResponseRecord {
        let latency_ms = self.elapsed_ms();

        let body = match response.body {
            Some(body) => body,
            None => match self.capture.absent_body {
                AbsentBodyPolicy::Empty => Bytes::new(),
                AbsentBodyPolicy::Failure => {
                    return ResponseRecord::failed(&self.request_id, ABSENT_BODY_MESSAGE, latency_ms);
                }
            },
        };
        let (body, body_length) = elide(
            body,
            self.capture.capture_response_body,
            self.capture.max_body_bytes,
            std::convert::identity,
        );

        let status_reason = response.reason.unwrap_or_else(|| {
            StatusCode::from_u16(response.status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or_default()
                .to_string()
        });

        ResponseRecord {
            request_id: self.request_id.clone(),
            timestamp: now_millis(),
            status_code: response.status,
            status_reason,
            headers: response.headers,
            body,
            body_length,
            failure: None,
            latency_ms,
        }
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if !self.terminated {
            let record = ResponseRecord::failed(&self.request_id, DROPPED_MESSAGE, self.elapsed_ms());
            self.report(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemorySink, RelayEvent};
    use std::collections::{HashMap, HashSet};
    use http::HeaderValue;

    fn relay_with(capture: CaptureConfig) -> (EventRelay, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (EventRelay::new(sink.clone(), capture), sink)
    }

    fn get_call() -> CallInfo {
        CallInfo {
            method: "GET".into(),
            uri: "http://x/y".into(),
            headers: vec![Header::new("Accept", "*/*")],
            body: None,
        }
    }

    #[test]
    fn test_get_then_ok_produces_matching_records() {
        let (relay, sink) = relay_with(CaptureConfig::default());

        let handle = relay.on_call_start_with_id("42", &get_call());
        handle.succeed(ResponseView {
            status: 200,
            reason: Some("OK".into()),
            headers: Vec::new(),
            body: Some(Bytes::from_static(b"{}")),
        });

        let requests = sink.requests();
        assert_eq!(requests.len(), 1);
        let req = &requests[0];
        assert_eq!(req.request_id, "42");
        assert_eq!(req.method, "GET");
        assert_eq!(req.uri, "http://x/y");
        assert_eq!(req.headers, vec![Header::new("Accept", "*/*")]);
        assert!(req.body.is_none());

        let responses = sink.responses();
        assert_eq!(responses.len(), 1);
        let resp = &responses[0];
        assert_eq!(resp.request_id, "42");
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.status_reason, "OK");
        assert_eq!(resp.body.as_deref(), Some(&b"{}"[..]));
        assert!(!resp.is_failure());
    }

    #[test]
    fn test_transport_error_reports_failure_without_body() {
        let (relay, sink) = relay_with(CaptureConfig::default());

        let handle = relay.on_call_start(&get_call());
        let id = handle.request_id().to_string();
        handle.fail("connection refused");

        let responses = sink.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].request_id, id);
        assert_eq!(responses[0].failure.as_deref(), Some("connection refused"));
        assert!(responses[0].body.is_none());
    }

    #[test]
    fn test_dropped_handle_still_terminates_once() {
        let (relay, sink) = relay_with(CaptureConfig::default());

        drop(relay.on_call_start_with_id("dropped", &get_call()));

        let responses = sink.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].request_id, "dropped");
        assert_eq!(responses[0].failure.as_deref(), Some(DROPPED_MESSAGE));
    }

    #[test]
    fn test_canonical_reason_when_none_given() {
        let (relay, sink) = relay_with(CaptureConfig::default());

        relay.on_call_start(&get_call()).succeed(ResponseView::new(
            StatusCode::NOT_FOUND,
            &HeaderMap::new(),
            Some(Bytes::new()),
        ));

        assert_eq!(sink.responses()[0].status_reason, "Not Found");
    }

    #[test]
    fn test_unknown_status_gets_empty_reason() {
        let (relay, sink) = relay_with(CaptureConfig::default());

        relay.on_call_start(&get_call()).succeed(ResponseView {
            status: 599,
            reason: None,
            headers: Vec::new(),
            body: Some(Bytes::new()),
        });

        let resp = &sink.responses()[0];
        assert_eq!(resp.status_code, 599);
        assert_eq!(resp.status_reason, "");
    }

    #[test]
    fn test_absent_body_policies() {
        let no_body = || ResponseView {
            status: 204,
            reason: None,
            headers: Vec::new(),
            body: None,
        };

        let (relay, sink) = relay_with(CaptureConfig::default());
        relay.on_call_start(&get_call()).succeed(no_body());
        assert_eq!(sink.responses()[0].body, Some(Bytes::new()));

        let (relay, sink) = relay_with(CaptureConfig {
            absent_body: AbsentBodyPolicy::Failure,
            ..CaptureConfig::default()
        });
        relay.on_call_start(&get_call()).succeed(no_body());
        let resp = &sink.responses()[0];
        assert_eq!(resp.failure.as_deref(), Some(ABSENT_BODY_MESSAGE));
        assert!(resp.body.is_none());
    }

    #[test]
    fn test_oversized_bodies_are_elided_with_length() {
        let (relay, sink) = relay_with(CaptureConfig {
            max_body_bytes: 4,
            ..CaptureConfig::default()
        });

        let call = CallInfo {
            method: "POST".into(),
            uri: "http://x/upload".into(),
            headers: Vec::new(),
            body: Some(Bytes::from_static(b"0123456789")),
        };
        relay.on_call_start(&call).succeed(ResponseView {
            status: 200,
            reason: None,
            headers: Vec::new(),
            body: Some(Bytes::from_static(b"abcdef")),
        });

        let req = &sink.requests()[0];
        assert!(req.body.is_none());
        assert_eq!(req.body_length, Some(10));

        let resp = &sink.responses()[0];
        assert!(resp.body.is_none());
        assert_eq!(resp.body_length, Some(6));
    }

    #[test]
    fn test_request_body_capture_can_be_disabled() {
        let (relay, sink) = relay_with(CaptureConfig {
            capture_request_body: false,
            ..CaptureConfig::default()
        });

        let call = CallInfo {
            body: Some(Bytes::from_static(b"secret")),
            ..get_call()
        };
        drop(relay.on_call_start(&call));

        let req = &sink.requests()[0];
        assert!(req.body.is_none());
        assert_eq!(req.body_length, Some(6));
    }

    #[test]
    fn test_http_request_body_is_borrowed_not_consumed() {
        let (relay, sink) = relay_with(CaptureConfig::default());
        let payload = Bytes::from_static(b"{\"name\":\"relay\"}");

        let request = http::Request::post("http://x/items")
            .header("Content-Type", "application/json")
            .body(payload.clone())
            .unwrap();
        drop(relay.on_call_start(&request));

        assert_eq!(request.body(), &payload);
        assert_eq!(request.body().len(), payload.len());

        let req = &sink.requests()[0];
        assert_eq!(req.body.as_ref(), Some(&payload));
        assert_eq!(req.first_header("content-type").unwrap().value, "application/json");
    }

    #[test]
    fn test_reqwest_request_without_payload_has_no_body() {
        let (relay, sink) = relay_with(CaptureConfig::default());
        let client = reqwest::Client::new();

        let empty = client.get("http://x/y").body(Vec::<u8>::new()).build().unwrap();
        drop(relay.on_call_start(&empty));
        let bare = client.get("http://x/y").build().unwrap();
        drop(relay.on_call_start(&bare));

        let requests = sink.requests();
        assert_eq!(requests.len(), 2);
        for req in &requests {
            assert!(req.body.is_none());
            assert!(req.body_length.is_none());
        }
    }

    #[test]
    fn test_relay_never_fills_response_code() {
        let (relay, sink) = relay_with(CaptureConfig::default());
        relay.on_call_start(&get_call()).succeed(ResponseView {
            status: 200,
            reason: None,
            headers: Vec::new(),
            body: Some(Bytes::new()),
        });
        assert!(sink.requests()[0].response_code.is_none());
    }

    #[test]
    fn test_response_body_within_limit_is_kept_as_is() {
        let (relay, sink) = relay_with(CaptureConfig {
            max_body_bytes: 6,
            ..CaptureConfig::default()
        });
        relay.on_call_start(&get_call()).succeed(ResponseView {
            status: 200,
            reason: None,
            headers: Vec::new(),
            body: Some(Bytes::from_static(b"abcdef")),
        });
        let resp = &sink.responses()[0];
        assert_eq!(resp.body.as_deref(), Some(&b"abcdef"[..]));
        assert!(resp.body_length.is_none());
    }

    #[test]
    fn test_streaming_request_body_records_declared_length() {
        struct Streamed;
        impl CallRequest for Streamed {
            fn method(&self) -> &str {
                "PUT"
            }
            fn uri(&self) -> String {
                "http://x/blob".into()
            }
            fn headers(&self) -> Vec<Header> {
                vec![Header::new("Content-Length", "2048")]
            }
            fn body(&self) -> RequestBody<'_> {
                RequestBody::Streaming
            }
        }

        let (relay, sink) = relay_with(CaptureConfig::default());
        drop(relay.on_call_start(&Streamed));

        let req = &sink.requests()[0];
        assert!(req.body.is_none());
        assert_eq!(req.body_length, Some(2048));
        assert!(req.message.is_some());
    }

    #[test]
    fn test_non_utf8_header_is_recorded_lossily() {
        let mut map = HeaderMap::new();
        map.insert("x-raw", HeaderValue::from_bytes(b"ok\xff").unwrap());
        map.append("x-dup", HeaderValue::from_static("1"));
        map.append("x-dup", HeaderValue::from_static("2"));

        let headers = headers_from_map(&map);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0].value, "ok\u{FFFD}");
        let dups: Vec<_> = headers.iter().filter(|h| h.name == "x-dup").map(|h| h.value.as_str()).collect();
        assert_eq!(dups, vec!["1", "2"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_started_call_terminates_exactly_once() {
        const CALLS: usize = 1000;
        let (relay, sink) = relay_with(CaptureConfig::default());

        let tasks: Vec<_> = (0..CALLS)
            .map(|i| {
                let relay = relay.clone();
                tokio::spawn(async move {
                    let handle = relay.on_call_start(&get_call());
                    tokio::task::yield_now().await;
                    match i % 3 {
                        0 => handle.succeed(ResponseView {
                            status: 200,
                            reason: None,
                            headers: Vec::new(),
                            body: Some(Bytes::new()),
                        }),
                        1 => handle.fail("timed out"),
                        _ => drop(handle),
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let mut started = HashSet::new();
        let mut terminated: HashMap<String, usize> = HashMap::new();
        for event in sink.events() {
            match event {
                RelayEvent::Request(r) => assert!(started.insert(r.request_id), "duplicate id"),
                RelayEvent::Response(r) => *terminated.entry(r.request_id).or_default() += 1,
            }
        }

        assert_eq!(started.len(), CALLS);
        assert_eq!(terminated.len(), CALLS);
        for id in &started {
            assert_eq!(terminated.get(id), Some(&1), "call {id} did not terminate once");
        }
    }
}
