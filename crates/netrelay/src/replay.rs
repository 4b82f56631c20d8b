//! Capture-then-replay for one-shot byte streams.
//!
//! HTTP bodies are usually single-consumption streams. To report a body and
//! still hand it to the rest of the pipeline, [`ReplayBody`] drains the
//! stream once and serves fresh readers over the buffered bytes. A stream
//! that fails midway replays the same way: the bytes read so far, then the
//! error.

use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;

/// The source stream failed before it was fully read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("body stream interrupted after {read} bytes: {message}")]
pub struct ReplayError {
    pub read: usize,
    pub message: String,
}

/// A body that has been read once and can be replayed any number of times.
#[derive(Debug, Clone)]
pub struct ReplayBody {
    data: Bytes,
    error: Option<ReplayError>,
}

impl ReplayBody {
    /// Drain `stream` into memory.
    ///
    /// Never fails: a stream error ends the capture and is kept for replay.
    pub async fn capture<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let mut stream = std::pin::pin!(stream);
        let mut buf = BytesMut::new();
        let mut error = None;

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => buf.extend_from_slice(&chunk),
                Err(e) => {
                    error = Some(ReplayError {
                        read: buf.len(),
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }

        Self {
            data: buf.freeze(),
            error,
        }
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            error: None,
        }
    }

    /// Bytes read from the source. Partial if the source failed.
    pub fn captured(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&ReplayError> {
        self.error.as_ref()
    }

    /// A fresh stream over the captured body.
    pub fn reader(&self) -> ReplayStream {
        ReplayStream {
            data: (!self.data.is_empty()).then(|| self.data.clone()),
            error: self.error.clone(),
        }
    }

    /// The whole body, or the capture error.
    pub fn into_bytes(self) -> Result<Bytes, ReplayError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.data),
        }
    }
}

/// Stream returned by [`ReplayBody::reader`]: the captured bytes as one
/// chunk, followed by the capture error if there was one.
#[derive(Debug)]
pub struct ReplayStream {
    data: Option<Bytes>,
    error: Option<ReplayError>,
}

impl Stream for ReplayStream {
    type Item = Result<Bytes, ReplayError>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(data) = self.data.take() {
            return Poll::Ready(Some(Ok(data)));
        }
        Poll::Ready(self.error.take().map(Err))
    }
}
