//! Transport-agnostic request/response records.
//!
//! Records are what the relay hands to a [`ReportSink`](crate::sink::ReportSink).
//! They serialize with camelCase keys; body bytes are encoded as base64
//! strings so the JSON stays printable.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single header name/value pair. Order and duplicates are preserved by
/// the containing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// First header whose name matches `name` ignoring ASCII case.
pub fn first_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a Header> {
    headers.iter().find(|h| h.name.eq_ignore_ascii_case(name))
}

/// Emitted once when a call starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub request_id: String,
    /// Capture time in milliseconds since the UNIX epoch.
    pub timestamp: u64,
    pub method: String,
    pub uri: String,
    pub headers: Vec<Header>,
    #[serde(default, with = "base64_body", skip_serializing_if = "Option::is_none")]
    pub body: Option<Bytes>,
    /// Real body size when the bytes were elided from `body`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_length: Option<u64>,
    /// Note about degraded capture (e.g. an uncapturable streaming body).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Terminal status code. Never set by the relay; only hosts that report
    /// a call after it finished fill it in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
}

impl RequestRecord {
    pub fn first_header(&self, name: &str) -> Option<&Header> {
        first_header(&self.headers, name)
    }
}

/// Emitted once when a call terminates, successfully or not.
///
/// The failure variant has `failure` set, `status_code == 0`, an empty
/// `status_reason` and no body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub request_id: String,
    pub timestamp: u64,
    pub status_code: u16,
    pub status_reason: String,
    pub headers: Vec<Header>,
    #[serde(default, with = "base64_body", skip_serializing_if = "Option::is_none")]
    pub body: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Milliseconds between call start and this record.
    pub latency_ms: u64,
}

impl ResponseRecord {
    /// Failure variant for a call that never produced a usable response.
    pub fn failed(request_id: impl Into<String>, message: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            request_id: request_id.into(),
            timestamp: now_millis(),
            status_code: 0,
            status_reason: String::new(),
            headers: Vec::new(),
            body: None,
            body_length: None,
            failure: Some(message.into()),
            latency_ms,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }

    pub fn first_header(&self, name: &str) -> Option<&Header> {
        first_header(&self.headers, name)
    }
}

/// Milliseconds since the UNIX epoch; 0 if the clock is before it.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
        match body {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Bytes>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| {
                STANDARD
                    .decode(s.as_bytes())
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}
