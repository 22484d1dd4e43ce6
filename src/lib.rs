//! # edgequake-doc2text
//!
//! Turn a document (a scanned image or a multi-page PDF) plus a
//! natural-language instruction into one structured text answer, using a
//! Vision Language Model.
//!
//! ## Why this crate?
//!
//! Receipts, bank statements, and invoices are images first and text second.
//! Instead of OCR plus brittle layout heuristics, this crate rasterises the
//! pages, hands them to a VLM together with an instruction ("extract every
//! transaction as YAML"), and collects the answer. The same request runs
//! against a model loaded in-process or an OpenAI-compatible server such as
//! vLLM, with identical sampling semantics.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document (path | URL)
//!  │
//!  ├─ 1. Input     read bytes once, verify PDF vs image
//!  ├─ 2. Render    first `max_pages` pages via pdfium (spawn_blocking), optional downscale
//!  ├─ 3. Encode    file:// (sandboxed) or data: URI
//!  ├─ 4. Prompt    images in page order, then the instruction
//!  ├─ 5. Backend   embedded engine or streaming chat completions
//!  ├─ 6. Collect   ordered deltas, cancellation, truncation flag
//!  └─ 7. Sink      atomic write to the output path
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_doc2text::{extract, Backend, ExtractionConfig, RemoteSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Build the backend once per process and reuse it for every request.
//!     let backend = Backend::remote(RemoteSettings::new(
//!         "http://localhost:8000",
//!         "Qwen/Qwen2.5-VL-7B-Instruct",
//!     ))?
//!     .into_handle();
//!
//!     let config = ExtractionConfig::builder()
//!         .instruction_path("instructions/receipt.txt")
//!         .max_pages(4)
//!         .build()?;
//!
//!     let output = extract("receipt.pdf", &config, &backend).await?;
//!     println!("{}", output.text);
//!     if output.truncated {
//!         eprintln!("warning: output hit max_tokens");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Backends
//!
//! | Backend | Transport | Image encoding | Notes |
//! |---------|-----------|----------------|-------|
//! | [`Backend::Remote`] | HTTP + SSE | inline `data:` URI | Any OpenAI-compatible server |
//! | [`Backend::Embedded`] | in-process | sandboxed `file://` (default) or inline | Engine supplied through [`EngineLoader`] |
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `doc2text` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-doc2text = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod collect;
pub mod config;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod sink;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{
    Backend, BackendHandle, BackendKind, DeltaStream, EmbeddedBackend, EngineLoader,
    EngineOutput, FinishReason, InferenceResult, InitOutcome, LocalEngine, RemoteBackend,
    StreamEvent, StreamFault,
};
pub use collect::{collect_result, collect_stream, CancelToken, CollectedResponse};
pub use config::{
    EmbeddedSettings, EncodingMode, ExtractionConfig, ExtractionConfigBuilder, PageFormat,
    PartialPolicy, RemoteSettings, SamplingConfig, SamplingConfigBuilder, SamplingParam,
    SamplingRequest,
};
pub use error::Doc2TextError;
pub use extract::{
    extract, extract_from_bytes, extract_sync, extract_to_file, extract_with_cancel,
    RequestSummary,
};
pub use output::{ExtractionOutput, ExtractionStats, PageInfo};
pub use pipeline::encode::{encode_image_file, encode_page, MediaReference, MediaKind};
pub use pipeline::prompt::{assemble, estimate_prompt_tokens, ContentPart, Message, Role};
pub use pipeline::render::{PdfRenderer, PdfiumRenderer, RenderedPdf};
pub use pipeline::sandbox::{validate_local_path, Sandbox};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use prompts::{Instruction, InstructionSource, DEFAULT_INSTRUCTION, DEFAULT_SYSTEM_PROMPT};
pub use sink::persist;
pub use stream::extract_stream;
