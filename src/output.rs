//! Result types returned by the extraction entry points.

use crate::backend::BackendKind;
use crate::prompts::InstructionSource;
use serde::Serialize;

/// The outcome of one extraction request.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionOutput {
    /// Model output (cleaned if `clean_output` was set).
    pub text: String,
    /// Generation stopped early: `max_tokens`, cancellation, or a broken stream.
    pub truncated: bool,
    /// The backend signalled completion.
    pub finished: bool,
    /// The caller cancelled the request.
    pub cancelled: bool,
    /// The stream broke and `PartialPolicy::BestEffort` kept the partial text.
    pub interrupted: bool,
    /// Where the instruction came from; `default` means the fallback was used.
    pub instruction_source: InstructionSource,
    /// The pages that were sent to the model, in order.
    pub pages: Vec<PageInfo>,
    pub stats: ExtractionStats,
}

/// Size of one page as sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    /// 1-based page number.
    pub index: usize,
    pub width: u32,
    pub height: u32,
}

/// Counters and timings for one request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionStats {
    pub backend: Option<BackendKind>,
    pub model: String,
    /// Pages in the source document.
    pub total_pages: usize,
    /// Pages sent to the model.
    pub used_pages: usize,
    /// Pages beyond `max_pages`.
    pub dropped_pages: usize,
    pub estimated_prompt_tokens: usize,
    pub output_chars: usize,
    pub render_ms: u64,
    pub inference_ms: u64,
    pub total_ms: u64,
}
