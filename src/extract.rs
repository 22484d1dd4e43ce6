//! Eager extraction entry points.
//!
//! These wait for the whole response and return an [`ExtractionOutput`].
//! Use [`crate::stream::extract_stream`] instead to consume deltas yourself.
//!
//! Every entry point runs the same preparation:
//!
//! ```text
//! instruction ─┐
//! input ──▶ rasterise ──▶ (save pages) ──▶ encode ──▶ assemble ──▶ messages
//! ```
//!
//! and then dispatches the messages to the caller's [`Backend`].

use crate::backend::Backend;
use crate::collect::{collect_stream, CancelToken, CollectedResponse};
use crate::config::{EncodingMode, ExtractionConfig, PartialPolicy};
use crate::error::Doc2TextError;
use crate::output::{ExtractionOutput, ExtractionStats, PageInfo};
use crate::pipeline::encode::{encode_page, MediaReference};
use crate::pipeline::input::{resolve_document, Document, DocumentSource};
use crate::pipeline::postprocess::clean_output;
use crate::pipeline::prompt::{assemble, estimate_prompt_tokens, Message};
use crate::pipeline::render::{rasterize, save_pages, PdfRenderer, PdfiumRenderer, RasterOptions};
use crate::prompts::{load_instruction, InstructionSource};
use crate::sink::persist;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Messages ready for dispatch plus what the caller should know about them.
pub(crate) struct PreparedRequest {
    pub messages: Vec<Message>,
    pub summary: RequestSummary,
    /// Temporary page directory for local-reference mode; removed on drop,
    /// so it must outlive the generation.
    pub scratch: Option<TempDir>,
}

/// What was prepared for the backend, minus the messages themselves.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub instruction_source: InstructionSource,
    pub pages: Vec<PageInfo>,
    pub total_pages: usize,
    pub dropped_pages: usize,
    pub estimated_prompt_tokens: usize,
    pub render_ms: u64,
}

/// Extract structured text from a document file or URL.
///
/// This is the primary entry point for the library.
///
/// # Arguments
/// * `input`  : local path or `http(s)` URL to an image or PDF
/// * `config` : per-request configuration
/// * `backend`: the process-wide backend (usually a [`crate::BackendHandle`])
///
/// # Errors
/// Every [`Doc2TextError`] is terminal for the request; nothing is retried.
/// With [`PartialPolicy::BestEffort`], a broken stream is returned as output
/// with `interrupted = true` instead of an error.
pub async fn extract(
    input: impl AsRef<str>,
    config: &ExtractionConfig,
    backend: &Backend,
) -> Result<ExtractionOutput, Doc2TextError> {
    extract_with_cancel(input, config, backend, &CancelToken::new()).await
}

/// Like [`extract`], but stops early when `cancel` fires.
///
/// A cancelled request is not an error: the text received so far is returned
/// with `cancelled = true` and `truncated = true`.
pub async fn extract_with_cancel(
    input: impl AsRef<str>,
    config: &ExtractionConfig,
    backend: &Backend,
    cancel: &CancelToken,
) -> Result<ExtractionOutput, Doc2TextError> {
    let total_start = Instant::now();
    let input = input.as_ref();
    info!("Starting extraction: {}", input);

    let document = resolve_document(input, config.download_timeout_secs).await?;
    let prepared = prepare(document, config, backend).await?;
    run(prepared, config, backend, cancel, total_start).await
}

/// Extract from document bytes already in memory.
///
/// `name` identifies the document in logs and errors; its extension, if
/// any, declares the kind, which is then verified against the bytes.
pub async fn extract_from_bytes(
    bytes: Vec<u8>,
    name: impl AsRef<str>,
    config: &ExtractionConfig,
    backend: &Backend,
) -> Result<ExtractionOutput, Doc2TextError> {
    let total_start = Instant::now();
    let name = name.as_ref();
    info!("Starting extraction from {} in-memory bytes ({})", bytes.len(), name);

    let document = Document::from_named_bytes(DocumentSource::Path(name.into()), bytes)?;
    let prepared = prepare(document, config, backend).await?;
    run(prepared, config, backend, &CancelToken::new(), total_start).await
}

async fn run(
    prepared: PreparedRequest,
    config: &ExtractionConfig,
    backend: &Backend,
    cancel: &CancelToken,
    total_start: Instant,
) -> Result<ExtractionOutput, Doc2TextError> {
    let PreparedRequest {
        messages,
        summary,
        scratch: _scratch,
    } = prepared;
    let progress = config.progress_callback.clone();

    // ── Generate ─────────────────────────────────────────────────────────
    if let Some(cb) = &progress {
        cb.on_generation_start(summary.pages.len());
    }
    let infer_start = Instant::now();

    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        s = backend.generate_stream(&messages, &config.sampling) => Some(s?),
    };

    let on_delta: &(dyn Fn(&str) + Send + Sync) = &|d: &str| {
        if let Some(cb) = &progress {
            cb.on_delta(d);
        }
    };

    let mut interrupted = false;
    let collected = match stream {
        None => {
            info!("Cancelled before the backend responded");
            CollectedResponse {
                full_text: String::new(),
                truncated: true,
                finished: false,
                cancelled: true,
            }
        }
        Some(stream) => match collect_stream(stream, cancel, Some(on_delta)).await {
            Ok(c) => c,
            Err(Doc2TextError::StreamInterrupted { partial, detail })
                if config.partial_policy == PartialPolicy::BestEffort =>
            {
                warn!(
                    "Stream interrupted ({}); keeping {} chars of partial output",
                    detail,
                    partial.chars().count()
                );
                interrupted = true;
                CollectedResponse {
                    full_text: partial,
                    truncated: true,
                    finished: false,
                    cancelled: false,
                }
            }
            Err(e) => return Err(e),
        },
    };
    let inference_ms = infer_start.elapsed().as_millis() as u64;

    let text = if config.clean_output {
        clean_output(&collected.full_text)
    } else {
        collected.full_text
    };

    if let Some(cb) = &progress {
        cb.on_generation_complete(text.chars().count(), collected.truncated);
    }

    let stats = ExtractionStats {
        backend: Some(backend.kind()),
        model: backend.model().to_string(),
        total_pages: summary.total_pages,
        used_pages: summary.pages.len(),
        dropped_pages: summary.dropped_pages,
        estimated_prompt_tokens: summary.estimated_prompt_tokens,
        output_chars: text.chars().count(),
        render_ms: summary.render_ms,
        inference_ms,
        total_ms: total_start.elapsed().as_millis() as u64,
    };

    info!(
        "Extraction done: {} chars, truncated={}, {}ms",
        stats.output_chars, collected.truncated, stats.total_ms
    );

    Ok(ExtractionOutput {
        text,
        truncated: collected.truncated,
        finished: collected.finished,
        cancelled: collected.cancelled,
        interrupted,
        instruction_source: summary.instruction_source,
        pages: summary.pages,
        stats,
    })
}

/// Extract and write the text to `output_path`.
///
/// Parent directories are created; an existing file is replaced.
pub async fn extract_to_file(
    input: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &ExtractionConfig,
    backend: &Backend,
) -> Result<ExtractionStats, Doc2TextError> {
    let output = extract(input, config, backend).await?;
    persist(&output.text, output_path).await?;
    Ok(output.stats)
}

/// Synchronous wrapper around [`extract`].
///
/// Creates a temporary tokio runtime internally; do not call from inside one.
pub fn extract_sync(
    input: impl AsRef<str>,
    config: &ExtractionConfig,
    backend: &Backend,
) -> Result<ExtractionOutput, Doc2TextError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Doc2TextError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract(input, config, backend))
}

/// Turn a document into the message list for `backend`.
pub(crate) async fn prepare(
    document: Document,
    config: &ExtractionConfig,
    backend: &Backend,
) -> Result<PreparedRequest, Doc2TextError> {
    // ── Step 1: Instruction and encoding mode ────────────────────────────
    let instruction =
        load_instruction(config.instruction_path.as_deref(), &config.default_instruction).await?;
    let encoding = backend.resolve_encoding(config.encoding)?;

    // ── Step 2: Rasterise ────────────────────────────────────────────────
    let render_start = Instant::now();
    let renderer: Arc<dyn PdfRenderer> = match &config.pdf_renderer {
        Some(r) => Arc::clone(r),
        None => Arc::new(PdfiumRenderer::new(config.render_max_pixels)),
    };
    let options = RasterOptions {
        max_pages: config.max_pages,
        target_max_dimension: config.target_max_dimension,
        password: config.password.clone(),
        timeout_secs: config.render_timeout_secs,
    };
    let raster = rasterize(&document, &options, renderer).await?;

    if let Some(cb) = &config.progress_callback {
        cb.on_document_rasterized(raster.total_pages, raster.pages.len(), raster.dropped_pages);
    }

    // ── Step 3: Materialise pages if needed ──────────────────────────────
    let mut scratch = None;
    let page_dir = match (&config.page_dir, encoding, backend.sandbox()) {
        (Some(dir), _, _) => Some(dir.clone()),
        (None, EncodingMode::LocalReference, Some(sandbox)) => {
            let tmp = tempfile::Builder::new()
                .prefix("doc2text-pages-")
                .tempdir_in(sandbox.root())
                .map_err(|source| Doc2TextError::WriteFailed {
                    path: sandbox.root().to_path_buf(),
                    source,
                })?;
            debug!("Materialising pages under {}", tmp.path().display());
            let dir = tmp.path().to_path_buf();
            scratch = Some(tmp);
            Some(dir)
        }
        (None, _, _) => None,
    };

    let mut pages = raster.pages;
    if let Some(dir) = page_dir {
        let format = config.page_format;
        pages = tokio::task::spawn_blocking(move || {
            let mut pages = pages;
            save_pages(&mut pages, &dir, format).map(|_| pages)
        })
        .await
        .map_err(|e| Doc2TextError::Internal(format!("Save task panicked: {}", e)))??;
    }
    let render_ms = render_start.elapsed().as_millis() as u64;

    // ── Step 4: Encode ───────────────────────────────────────────────────
    let references = pages
        .iter()
        .map(|p| encode_page(p, encoding, config.page_format, backend.sandbox()))
        .collect::<Result<Vec<MediaReference>, _>>()?;

    // ── Step 5: Assemble ─────────────────────────────────────────────────
    let messages = assemble(
        &instruction,
        &references,
        backend.image_limit(),
        config.system_prompt.as_deref(),
    )?;

    let summary = RequestSummary {
        instruction_source: instruction.source().clone(),
        pages: pages
            .iter()
            .map(|p| PageInfo {
                index: p.index,
                width: p.width,
                height: p.height,
            })
            .collect(),
        total_pages: raster.total_pages,
        dropped_pages: raster.dropped_pages,
        estimated_prompt_tokens: estimate_prompt_tokens(&messages),
        render_ms,
    };

    Ok(PreparedRequest {
        messages,
        summary,
        scratch,
    })
}
