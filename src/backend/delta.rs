//! [`DeltaStream`]: the lazy, finite, non-restartable sequence of text deltas
//! every backend hands back from `generate_stream`.
//!
//! The stream remembers the text it has already yielded. When the transport
//! breaks mid-generation it surfaces [`Doc2TextError::StreamInterrupted`] with
//! that text attached instead of a bare I/O error, so the caller can still
//! apply a best-effort policy.
//!
//! Closing is explicit and idempotent: [`DeltaStream::close`] drops the
//! underlying producer (for the remote backend, the HTTP response body and
//! with it the connection) and runs the close hook at most once. Reaching the
//! end of the stream, a fault, or dropping the value all close it as well.

use crate::backend::sse::FinishReason;
use crate::error::Doc2TextError;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_stream::Stream;
use tracing::debug;

/// One item of a [`DeltaStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text appended by the model. May be empty.
    Delta(String),
    /// The backend signalled completion. `reason` is `None` when the server
    /// sent its end sentinel without a finish reason.
    Finished { reason: Option<FinishReason> },
}

/// Failure reported by a stream producer.
#[derive(Debug)]
pub enum StreamFault {
    /// The connection broke; becomes `StreamInterrupted` with the partial text.
    Transport(String),
    /// Any other error, passed through unchanged.
    Fatal(Doc2TextError),
}

type RawStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, StreamFault>> + Send>>;

/// Ordered text deltas from one generation request.
pub struct DeltaStream {
    inner: Option<RawStream>,
    received: String,
    close_hook: Option<Box<dyn FnOnce() + Send>>,
}

impl DeltaStream {
    /// Wrap a producer of raw events.
    pub fn new<S>(inner: S) -> Self
    where
        S: Stream<Item = Result<StreamEvent, StreamFault>> + Send + 'static,
    {
        Self {
            inner: Some(Box::pin(inner)),
            received: String::new(),
            close_hook: None,
        }
    }

    /// A stream that yields `text` once, then the given completion.
    pub fn from_complete(text: String, reason: Option<FinishReason>) -> Self {
        let events = vec![
            Ok(StreamEvent::Delta(text)),
            Ok(StreamEvent::Finished { reason }),
        ];
        Self::new(futures::stream::iter(events))
    }

    /// Run `hook` exactly once, when the stream is closed for any reason.
    ///
    /// Hooks accumulate and run in the order they were added.
    pub fn with_close_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        let previous = self.close_hook.take();
        self.close_hook = Some(Box::new(move || {
            if let Some(previous) = previous {
                previous();
            }
            hook();
        }));
        self
    }

    /// Text yielded so far, in arrival order.
    pub fn received(&self) -> &str {
        &self.received
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Stop consuming and release the producer. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            debug!("Delta stream closed after {} chars", self.received.len());
        }
        if let Some(hook) = self.close_hook.take() {
            hook();
        }
    }
}

impl Stream for DeltaStream {
    type Item = Result<StreamEvent, Doc2TextError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.close();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(event))) => {
                if let StreamEvent::Delta(text) = &event {
                    this.received.push_str(text);
                }
                Poll::Ready(Some(Ok(event)))
            }
            Poll::Ready(Some(Err(fault))) => {
                this.close();
                let err = match fault {
                    StreamFault::Transport(detail) => Doc2TextError::StreamInterrupted {
                        partial: this.received.clone(),
                        detail,
                    },
                    StreamFault::Fatal(e) => e,
                };
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl Drop for DeltaStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for DeltaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaStream")
            .field("received_chars", &self.received.chars().count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
