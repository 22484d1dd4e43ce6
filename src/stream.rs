//! Streaming extraction API: hand the caller the delta stream itself.
//!
//! [`crate::extract::extract`] waits for the full response. [`extract_stream`]
//! prepares the same request, dispatches it, and returns the
//! [`DeltaStream`] as soon as the backend has accepted it, so callers can
//! render text as it arrives, apply their own cancellation, or forward deltas
//! elsewhere.
//!
//! The stream is lazy, finite, and not restartable. Dropping it closes the
//! underlying connection.

use crate::backend::{Backend, DeltaStream};
use crate::config::ExtractionConfig;
use crate::error::Doc2TextError;
use crate::extract::{prepare, PreparedRequest, RequestSummary};
use crate::pipeline::input::resolve_document;
use tracing::info;

/// Prepare and dispatch a request, returning its summary and delta stream.
///
/// `config.clean_output`, `config.partial_policy`, and the progress
/// callback's `on_delta` do not apply here; the caller owns the stream.
///
/// # Example
/// ```rust,no_run
/// use edgequake_doc2text::{extract_stream, Backend, ExtractionConfig, RemoteSettings, StreamEvent};
/// use futures::StreamExt;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = Backend::remote(RemoteSettings::new("http://localhost:8000", "Qwen/Qwen2.5-VL-7B-Instruct"))?;
/// let (summary, mut deltas) = extract_stream("receipt.pdf", &ExtractionConfig::default(), &backend).await?;
/// eprintln!("{} pages sent", summary.pages.len());
/// while let Some(event) = deltas.next().await {
///     if let StreamEvent::Delta(text) = event? {
///         print!("{text}");
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub async fn extract_stream(
    input: impl AsRef<str>,
    config: &ExtractionConfig,
    backend: &Backend,
) -> Result<(RequestSummary, DeltaStream), Doc2TextError> {
    let input = input.as_ref();
    info!("Starting streaming extraction: {}", input);

    let document = resolve_document(input, config.download_timeout_secs).await?;
    let PreparedRequest {
        messages,
        summary,
        scratch,
    } = prepare(document, config, backend).await?;

    if let Some(cb) = &config.progress_callback {
        cb.on_generation_start(summary.pages.len());
    }
    let mut stream = backend.generate_stream(&messages, &config.sampling).await?;
    if let Some(dir) = scratch {
        // Temporary pages must stay on disk until the engine is done with them.
        stream = stream.with_close_hook(move || drop(dir));
    }
    Ok((summary, stream))
}
