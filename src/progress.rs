//! Progress-callback trait for extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as the pipeline runs: once after rasterisation, once when the
//! backend call starts, once per streamed delta, and once at the end.
//!
//! Callbacks keep the library ignorant of how the host reports progress: a
//! terminal spinner, a WebSocket, or a log line all fit behind the trait.
//!
//! # Example
//!
//! ```rust
//! use edgequake_doc2text::{ExtractionProgressCallback, ExtractionConfig};
//! use std::sync::{Arc, Mutex};
//!
//! struct Echo {
//!     text: Mutex<String>,
//! }
//!
//! impl ExtractionProgressCallback for Echo {
//!     fn on_delta(&self, delta: &str) {
//!         self.text.lock().unwrap().push_str(delta);
//!     }
//! }
//!
//! let echo = Arc::new(Echo { text: Mutex::new(String::new()) });
//! let config = ExtractionConfig::builder()
//!     .progress_callback(echo as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the extraction pipeline as a request progresses.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Deltas arrive on the task that drives the request,
/// strictly in order.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once after the document has been rasterised.
    ///
    /// # Arguments
    /// * `total_pages`: pages in the source document
    /// * `used_pages` : pages that will be sent to the model
    /// * `dropped`    : pages beyond `max_pages`
    fn on_document_rasterized(&self, total_pages: usize, used_pages: usize, dropped: usize) {
        let _ = (total_pages, used_pages, dropped);
    }

    /// Called just before the backend request is dispatched.
    fn on_generation_start(&self, image_count: usize) {
        let _ = image_count;
    }

    /// Called for every non-empty text delta, in arrival order.
    fn on_delta(&self, delta: &str) {
        let _ = delta;
    }

    /// Called once after the response has been collected.
    ///
    /// # Arguments
    /// * `text_len` : characters in the collected text
    /// * `truncated`: generation stopped early (max_tokens, cancel, or broken stream)
    fn on_generation_complete(&self, text_len: usize, truncated: bool) {
        let _ = (text_len, truncated);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
