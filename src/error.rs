//! Error types for the edgequake-doc2text library.
//!
//! Every failure in the pipeline is terminal for the current request: nothing
//! is retried internally. Retry policy belongs to the caller, who gets enough
//! context on each variant (offending path, page number, exceeded limit) to
//! decide what to do next.
//!
//! Two variants deserve special mention:
//!
//! * [`Doc2TextError::PathOutsideSandbox`] is a security boundary violation.
//!   It is never downgraded to a warning; see
//!   [`Doc2TextError::is_security_violation`].
//!
//! * [`Doc2TextError::StreamInterrupted`] carries the text received before the
//!   transport failed, so callers can choose between "best effort" and
//!   "all or nothing" (see [`crate::config::PartialPolicy`]).

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-doc2text library.
#[derive(Debug, Error)]
pub enum Doc2TextError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    DocumentNotFound { path: PathBuf },

    /// The bytes could not be parsed as the declared document kind.
    #[error("Unsupported document '{source_name}': {detail}")]
    UnsupportedDocument { source_name: String, detail: String },

    /// HTTP download of a document failed or timed out.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{source_name}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { source_name: String },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{source_name}'")]
    WrongPassword { source_name: String },

    // ── Rasterisation errors ──────────────────────────────────────────────
    /// The rasteriser failed (missing pdfium, render fault, timeout).
    #[error("Rasterisation failed{}: {detail}", .page.map(|p| format!(" for page {p}")).unwrap_or_default())]
    RasterizationFailed { page: Option<usize>, detail: String },

    // ── Encoding / sandbox errors ─────────────────────────────────────────
    /// A local-file reference resolved outside the allowed root.
    #[error("Path '{path}' resolves outside the allowed media root '{root}'")]
    PathOutsideSandbox { path: PathBuf, root: PathBuf },

    /// Local-reference mode was requested for a page that was never written to disk.
    #[error("Page {page} has no materialised file; set a page directory for local-reference mode")]
    PageNotMaterialized { page: usize },

    /// The page could not be serialised into the transport image format.
    #[error("Failed to encode page {page}: {detail}")]
    EncodingFailed { page: usize, detail: String },

    // ── Prompt errors ─────────────────────────────────────────────────────
    /// The instruction file exists but could not be read.
    #[error("Failed to read instruction from '{path}': {source}")]
    InstructionUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// More images than the backend accepts in a single prompt.
    #[error("Too many images for one prompt: {count} given, backend accepts at most {limit}")]
    TooManyImages { count: usize, limit: usize },

    /// Prompt tokens plus `max_tokens` exceed the model's context window.
    #[error(
        "Context length exceeded: ~{prompt_tokens} prompt tokens + {max_tokens} max_tokens > {context_window}\n\
Lower --max-tokens, --max-pages, or set --max-dimension to shrink page images."
    )]
    ContextLengthExceeded {
        prompt_tokens: usize,
        max_tokens: usize,
        context_window: usize,
    },

    // ── Backend errors ────────────────────────────────────────────────────
    /// The remote backend did not answer within the configured timeout.
    #[error("Backend timed out after {secs}s")]
    BackendTimeout { secs: u64 },

    /// The stream broke before completion; `partial` holds what arrived.
    #[error("Stream interrupted after {} chars: {detail}", .partial.chars().count())]
    StreamInterrupted { partial: String, detail: String },

    /// The backend refused the request (HTTP error status or engine failure).
    #[error("Backend rejected the request{}: {detail}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    BackendRejected { status: Option<u16>, detail: String },

    /// An embedded backend was used before its engine was loaded.
    #[error("Embedded backend '{model}' is not initialised; call initialize() at startup")]
    BackendNotInitialized { model: String },

    // ── Output errors ─────────────────────────────────────────────────────
    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Doc2TextError {
    /// True for failures that cross the local-file trust boundary.
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Doc2TextError::PathOutsideSandbox { .. })
    }

    /// Text received before a stream broke, if any.
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            Doc2TextError::StreamInterrupted { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_many_images_display() {
        let e = Doc2TextError::TooManyImages { count: 6, limit: 4 };
        let msg = e.to_string();
        assert!(msg.contains("6 given"), "got: {msg}");
        assert!(msg.contains("at most 4"), "got: {msg}");
    }

    #[test]
    fn rasterization_display_with_and_without_page() {
        let e = Doc2TextError::RasterizationFailed {
            page: Some(3),
            detail: "boom".into(),
        };
        assert!(e.to_string().contains("for page 3"));

        let e = Doc2TextError::RasterizationFailed {
            page: None,
            detail: "no pdfium".into(),
        };
        assert!(!e.to_string().contains("for page"));
        assert!(e.to_string().contains("no pdfium"));
    }

    #[test]
    fn stream_interrupted_exposes_partial() {
        let e = Doc2TextError::StreamInterrupted {
            partial: "Tot".into(),
            detail: "connection reset".into(),
        };
        assert_eq!(e.partial_text(), Some("Tot"));
        assert!(e.to_string().contains("3 chars"));
    }

    #[test]
    fn only_sandbox_errors_are_security_violations() {
        let e = Doc2TextError::PathOutsideSandbox {
            path: "/etc/passwd".into(),
            root: "/srv/media".into(),
        };
        assert!(e.is_security_violation());
        assert!(!Doc2TextError::BackendTimeout { secs: 5 }.is_security_violation());
    }

    #[test]
    fn backend_rejected_display_with_status() {
        let e = Doc2TextError::BackendRejected {
            status: Some(400),
            detail: "bad request".into(),
        };
        assert!(e.to_string().contains("HTTP 400"));
        assert!(e.to_string().contains("bad request"));
    }
}
