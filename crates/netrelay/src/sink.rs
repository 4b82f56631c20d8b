//! Reporting sinks.
//!
//! A sink receives every record the relay produces. Calls arrive from
//! whatever task happens to drive the HTTP call, so implementations must be
//! `Send + Sync` and must not block: buffer or hand off instead.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::record::{RequestRecord, ResponseRecord};

/// Consumer of relay records. Both methods are fire-and-forget.
pub trait ReportSink: Send + Sync {
    fn report_request(&self, record: RequestRecord);

    fn report_response(&self, record: ResponseRecord);
}

impl<T: ReportSink + ?Sized> ReportSink for Arc<T> {
    fn report_request(&self, record: RequestRecord) {
        (**self).report_request(record)
    }

    fn report_response(&self, record: ResponseRecord) {
        (**self).report_response(record)
    }
}

/// A record tagged with its kind, as sent over channels and to collectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEvent {
    Request(RequestRecord),
    Response(ResponseRecord),
}

impl RelayEvent {
    pub fn request_id(&self) -> &str {
        match self {
            RelayEvent::Request(r) => &r.request_id,
            RelayEvent::Response(r) => &r.request_id,
        }
    }
}

/// Writes one structured log line per record.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn report_request(&self, record: RequestRecord) {
        tracing::info!(
            request_id = %record.request_id,
            method = %record.method,
            uri = %record.uri,
            headers = record.headers.len(),
            body_bytes = record.body.as_ref().map(|b| b.len()),
            body_length = record.body_length,
            "Request started"
        );
    }

    fn report_response(&self, record: ResponseRecord) {
        match record.failure {
            Some(ref failure) => tracing::warn!(
                request_id = %record.request_id,
                latency_ms = record.latency_ms,
                failure = %failure,
                "Request failed"
            ),
            None => tracing::info!(
                request_id = %record.request_id,
                status = record.status_code,
                reason = %record.status_reason,
                latency_ms = record.latency_ms,
                body_bytes = record.body.as_ref().map(|b| b.len()),
                body_length = record.body_length,
                "Response received"
            ),
        }
    }
}

/// Forwards records into an unbounded tokio channel.
///
/// Once the receiver is gone, records are dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: RelayEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Relay event receiver closed, dropping record");
        }
    }
}

impl ReportSink for ChannelSink {
    fn report_request(&self, record: RequestRecord) {
        self.send(RelayEvent::Request(record));
    }

    fn report_response(&self, record: ResponseRecord) {
        self.send(RelayEvent::Response(record));
    }
}

/// Keeps every record in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<RelayEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all events received so far.
    ///
    /// A panic while the lock was held does not hide earlier events.
    pub fn events(&self) -> Vec<RelayEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RelayEvent::Request(r) => Some(r),
                RelayEvent::Response(_) => None,
            })
            .collect()
    }

    pub fn responses(&self) -> Vec<ResponseRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RelayEvent::Response(r) => Some(r),
                RelayEvent::Request(_) => None,
            })
            .collect()
    }

    fn push(&self, event: RelayEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl ReportSink for MemorySink {
    fn report_request(&self, record: RequestRecord) {
        self.push(RelayEvent::Request(record));
    }

    fn report_response(&self, record: ResponseRecord) {
        self.push(RelayEvent::Response(record));
    }
}

/// Hands each record to every inner sink.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn ReportSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn ReportSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ReportSink for FanoutSink {
    fn report_request(&self, record: RequestRecord) {
        for sink in &self.sinks {
            sink.report_request(record.clone());
        }
    }

    fn report_response(&self, record: ResponseRecord) {
        for sink in &self.sinks {
            sink.report_response(record.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> RequestRecord {
        RequestRecord {
            request_id: id.to_string(),
            timestamp: 0,
            method: "GET".into(),
            uri: "http://localhost/".into(),
            headers: Vec::new(),
            body: None,
            body_length: None,
            message: None,
            response_code: None,
        }
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.report_request(request("1"));
        sink.report_response(ResponseRecord::failed("1", "boom", 3));

        assert!(matches!(rx.recv().await, Some(RelayEvent::Request(r)) if r.request_id == "1"));
        assert!(matches!(rx.recv().await, Some(RelayEvent::Response(r)) if r.is_failure()));
    }

    #[test]
    fn test_channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.report_request(request("1"));
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new(vec![
            a.clone() as Arc<dyn ReportSink>,
            b.clone() as Arc<dyn ReportSink>,
        ]);

        fanout.report_request(request("7"));
        fanout.report_response(ResponseRecord::failed("7", "timeout", 1));

        for sink in [a, b] {
            let events = sink.events();
            assert_eq!(events.len(), 2);
            assert!(events.iter().all(|e| e.request_id() == "7"));
        }
    }

    #[test]
    fn test_memory_sink_keeps_recording_after_poison() {
        let sink = Arc::new(MemorySink::new());
        sink.report_request(request("1"));

        let poisoner = sink.clone();
        let joined = std::thread::spawn(move || {
            let _guard = poisoner.events.lock().unwrap();
            panic!("poison the event log");
        })
        .join();
        assert!(joined.is_err());
        assert!(sink.events.is_poisoned());

        sink.report_response(ResponseRecord::failed("1", "boom", 0));
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(sink.responses()[0].failure.as_deref(), Some("boom"));
    }

    #[test]
    fn test_relay_event_is_tagged() {
        let value = serde_json::to_value(RelayEvent::Request(request("3"))).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["requestId"], "3");
    }
}
