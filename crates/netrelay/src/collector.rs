//! Sink that ships relay events to a debugging-tool endpoint.
//!
//! Reporting only enqueues; a background task POSTs each event as JSON, one
//! at a time, in the order reported. Delivery failures are logged and the
//! event is dropped: there are no retries.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::record::{RequestRecord, ResponseRecord};
use crate::sink::{ChannelSink, RelayEvent, ReportSink};

#[derive(Debug, Clone)]
pub struct CollectorSink {
    inner: ChannelSink,
}

impl CollectorSink {
    /// Start the delivery task on the current tokio runtime.
    ///
    /// The task ends once every clone of the sink is dropped and the queue
    /// has drained; await the returned handle to flush on shutdown.
    pub fn spawn(client: reqwest::Client, url: impl Into<String>) -> (Self, JoinHandle<()>) {
        let url = url.into();
        let (inner, rx) = ChannelSink::new();
        tracing::info!(collector = %url, "Collector sink started");
        let task = tokio::spawn(deliver(client, url, rx));
        (Self { inner }, task)
    }
}

impl ReportSink for CollectorSink {
    fn report_request(&self, record: RequestRecord) {
        self.inner.report_request(record);
    }

    fn report_response(&self, record: ResponseRecord) {
        self.inner.report_response(record);
    }
}

async fn deliver(client: reqwest::Client, url: String, mut rx: mpsc::UnboundedReceiver<RelayEvent>) {
    let mut delivered = 0_u64;
    let mut dropped = 0_u64;

    while let Some(event) = rx.recv().await {
        let result = client.post(&url).json(&event).send().await;
        match result {
            Ok(resp) if resp.status().is_success() => delivered += 1,
            Ok(resp) => {
                dropped += 1;
                tracing::warn!(
                    request_id = %event.request_id(),
                    status = resp.status().as_u16(),
                    "Collector rejected relay event"
                );
            }
            Err(e) => {
                dropped += 1;
                tracing::warn!(
                    request_id = %event.request_id(),
                    error = %e,
                    "Failed to deliver relay event to collector"
                );
            }
        }
    }

    tracing::info!(delivered, dropped, "Collector sink stopped");
}
