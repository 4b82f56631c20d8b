//! netrelay: reports HTTP call lifecycles to a debugging sink.
//!
//! An [`EventRelay`] turns each call into a [`RequestRecord`] at start and
//! exactly one [`ResponseRecord`] at the end, success or failure, and hands
//! both to a [`ReportSink`]. [`RelayClient`] attaches the relay to a
//! `reqwest::Client`.

pub mod client;
pub mod collector;
pub mod correlation;
pub mod record;
pub mod relay;
pub mod replay;
pub mod sink;

pub use client::{BodyError, RelayClient, RelayedResponse};
pub use collector::CollectorSink;
pub use record::{first_header, Header, RequestRecord, ResponseRecord};
pub use relay::{
    AbsentBodyPolicy, CallHandle, CallInfo, CallRequest, CaptureConfig, EventRelay, RequestBody,
    ResponseView,
};
pub use replay::{ReplayBody, ReplayError};
pub use sink::{ChannelSink, FanoutSink, MemorySink, RelayEvent, ReportSink, TracingSink};
