//! Atomic relay statistics counters.
//!
//! `ProxyStats` is itself a sink: placed in the fan-out next to the real
//! sinks, it counts every record the relay reports. All atomics use
//! `Relaxed` ordering; these are display counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use netrelay::{ReportSink, RequestRecord, ResponseRecord};
use serde::Serialize;

#[derive(Default)]
struct StatsInner {
    calls_started: AtomicU64,
    calls_completed: AtomicU64,
    calls_failed: AtomicU64,
    bytes_captured: AtomicU64,
    passthrough_requests: AtomicU64,
}

/// Thread-safe counters. Cheap to clone (Arc).
#[derive(Clone, Default)]
pub struct ProxyStats {
    inner: Arc<StatsInner>,
}

/// Snapshot of current counter values, serializable to JSON.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub calls_started: u64,
    pub calls_completed: u64,
    pub calls_failed: u64,
    pub bytes_captured: u64,
    pub passthrough_requests: u64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request forwarded while capture was off.
    pub fn inc_passthrough(&self) {
        self.inner.passthrough_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn add_bytes(&self, n: usize) {
        self.inner.bytes_captured.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            calls_started: self.inner.calls_started.load(Ordering::Relaxed),
            calls_completed: self.inner.calls_completed.load(Ordering::Relaxed),
            calls_failed: self.inner.calls_failed.load(Ordering::Relaxed),
            bytes_captured: self.inner.bytes_captured.load(Ordering::Relaxed),
            passthrough_requests: self.inner.passthrough_requests.load(Ordering::Relaxed),
        }
    }
}

impl ReportSink for ProxyStats {
    fn report_request(&self, record: RequestRecord) {
        self.inner.calls_started.fetch_add(1, Ordering::Relaxed);
        if let Some(ref body) = record.body {
            self.add_bytes(body.len());
        }
    }

    fn report_response(&self, record: ResponseRecord) {
        if record.is_failure() {
            self.inner.calls_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.calls_completed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(ref body) = record.body {
            self.add_bytes(body.len());
        }
    }
}
