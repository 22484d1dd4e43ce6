//! Response collection and cancellation.
//!
//! [`collect_stream`] drains a [`DeltaStream`] into one string, in arrival
//! order, while watching a [`CancelToken`]. Cancellation is checked first on
//! every wake-up, so once it is requested no further delta is consumed: the
//! stream is closed (releasing its connection) and the text gathered so far
//! is returned flagged `truncated`.

use crate::backend::{DeltaStream, InferenceResult, StreamEvent};
use crate::error::Doc2TextError;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Cloneable cancellation flag shared between a request and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            debug!("Cancellation requested");
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Text collected from one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedResponse {
    pub full_text: String,
    /// Generation stopped early: `max_tokens`, cancellation, or a broken stream.
    pub truncated: bool,
    /// The backend signalled completion.
    pub finished: bool,
    pub cancelled: bool,
}

/// Wrap a batch result.
pub fn collect_result(result: InferenceResult) -> CollectedResponse {
    CollectedResponse {
        full_text: result.text,
        truncated: result.truncated,
        finished: result.finished,
        cancelled: false,
    }
}

/// Drain `stream`, calling `on_delta` for every non-empty delta.
///
/// Empty deltas are skipped and never end the stream. A fault ends collection
/// with the stream's error; for a broken connection that is
/// [`Doc2TextError::StreamInterrupted`] carrying the text received so far.
pub async fn collect_stream(
    mut stream: DeltaStream,
    cancel: &CancelToken,
    on_delta: Option<&(dyn Fn(&str) + Send + Sync)>,
) -> Result<CollectedResponse, Doc2TextError> {
    let mut full_text = String::new();
    let mut finished = false;
    let mut truncated = false;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                stream.close();
                info!("Generation cancelled after {} chars", full_text.chars().count());
                return Ok(CollectedResponse {
                    full_text,
                    truncated: true,
                    finished: false,
                    cancelled: true,
                });
            }

            next = stream.next() => match next {
                None => break,
                Some(Ok(StreamEvent::Delta(delta))) => {
                    if delta.is_empty() {
                        continue;
                    }
                    if let Some(cb) = on_delta {
                        cb(&delta);
                    }
                    full_text.push_str(&delta);
                }
                Some(Ok(StreamEvent::Finished { reason })) => {
                    finished = true;
                    truncated = reason.is_some_and(|r| r.is_truncation());
                }
                Some(Err(e)) => return Err(e),
            },
        }
    }

    stream.close();
    Ok(CollectedResponse {
        full_text,
        truncated,
        finished,
        cancelled: false,
    })
}
