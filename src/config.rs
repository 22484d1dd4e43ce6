//! Configuration types for document extraction.
//!
//! Three groups of knobs live here:
//!
//! * [`ExtractionConfig`]: per-pipeline behaviour (page bounds, encoding,
//!   instruction source, partial-output policy), built via
//!   [`ExtractionConfigBuilder`].
//! * [`SamplingConfig`]: the sampling contract shared by both backends,
//!   built via [`SamplingConfigBuilder`] and validated field by field.
//! * [`EmbeddedSettings`] / [`RemoteSettings`]: what a
//!   [`crate::backend::Backend`] is constructed from, once per process.
//!
//! # Design choice: builder over constructor
//! The builders let callers set only what they care about and rely on
//! documented defaults for the rest. Sampling values are *validated* rather
//! than clamped: a temperature of 5.0 is a caller bug worth surfacing.

use crate::error::Doc2TextError;
use crate::pipeline::render::PdfRenderer;
use crate::progress::ProgressCallback;
use crate::prompts::DEFAULT_INSTRUCTION;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Smallest longest-edge pdfium is asked to render at.
const MIN_RENDER_PIXELS: u32 = 100;

/// Configuration for one extraction request.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_doc2text::{ExtractionConfig, SamplingConfig};
///
/// let config = ExtractionConfig::builder()
///     .max_pages(4)
///     .target_max_dimension(1024)
///     .sampling(SamplingConfig::builder().temperature(0.0).build().unwrap())
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Maximum number of PDF pages sent to the model. Default: 6.
    ///
    /// Pages beyond this bound are dropped (bounded cost over completeness);
    /// the drop count is reported in [`crate::output::ExtractionStats`].
    pub max_pages: usize,

    /// Downscale pages whose longer side exceeds this many pixels. Default: None.
    ///
    /// Keeps transport payloads and image-token cost bounded. 1024 is a good
    /// value for receipts and statements.
    pub target_max_dimension: Option<u32>,

    /// Longest edge pdfium renders at, before any downscale. Default: 2000.
    pub render_max_pixels: u32,

    /// Rasterisation timeout in seconds. Default: 120.
    pub render_timeout_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// How page images reach the backend. `None` lets the backend choose.
    pub encoding: Option<EncodingMode>,

    /// Container format used for inline encoding and materialised pages. Default: JPEG.
    pub page_format: PageFormat,

    /// Directory where rasterised pages are written.
    ///
    /// Useful for inspecting exactly what the model saw. In
    /// [`EncodingMode::LocalReference`] mode without a directory, pages go to
    /// a temporary directory under the allowed media root that is removed
    /// once the request finishes.
    pub page_dir: Option<PathBuf>,

    /// Path to the instruction text file.
    pub instruction_path: Option<PathBuf>,

    /// Instruction used when `instruction_path` is absent or missing.
    pub default_instruction: String,

    /// System message content. `None` sends no system message.
    pub system_prompt: Option<String>,

    /// Sampling parameters for the model call.
    pub sampling: SamplingConfig,

    /// What to do when the stream breaks mid-generation. Default: all-or-nothing.
    pub partial_policy: PartialPolicy,

    /// Strip outer code fences and normalise whitespace in the output. Default: false.
    pub clean_output: bool,

    /// Pre-constructed PDF renderer. Default: pdfium bound from the system library.
    pub pdf_renderer: Option<Arc<dyn PdfRenderer>>,

    /// Optional progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_pages: 6,
            target_max_dimension: None,
            render_max_pixels: 2000,
            render_timeout_secs: 120,
            download_timeout_secs: 120,
            password: None,
            encoding: None,
            page_format: PageFormat::default(),
            page_dir: None,
            instruction_path: None,
            default_instruction: DEFAULT_INSTRUCTION.to_string(),
            system_prompt: None,
            sampling: SamplingConfig::default(),
            partial_policy: PartialPolicy::default(),
            clean_output: false,
            pdf_renderer: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("max_pages", &self.max_pages)
            .field("target_max_dimension", &self.target_max_dimension)
            .field("render_max_pixels", &self.render_max_pixels)
            .field("encoding", &self.encoding)
            .field("page_format", &self.page_format)
            .field("page_dir", &self.page_dir)
            .field("instruction_path", &self.instruction_path)
            .field("system_prompt", &self.system_prompt.as_ref().map(|s| s.len()))
            .field("sampling", &self.sampling)
            .field("partial_policy", &self.partial_policy)
            .field("clean_output", &self.clean_output)
            .field("pdf_renderer", &self.pdf_renderer.as_ref().map(|_| "<dyn PdfRenderer>"))
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ExtractionConfig`].
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = n;
        self
    }

    pub fn target_max_dimension(mut self, px: u32) -> Self {
        self.config.target_max_dimension = Some(px);
        self
    }

    pub fn render_max_pixels(mut self, px: u32) -> Self {
        self.config.render_max_pixels = px;
        self
    }

    pub fn render_timeout_secs(mut self, secs: u64) -> Self {
        self.config.render_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn encoding(mut self, mode: EncodingMode) -> Self {
        self.config.encoding = Some(mode);
        self
    }

    pub fn page_format(mut self, format: PageFormat) -> Self {
        self.config.page_format = format;
        self
    }

    pub fn page_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.page_dir = Some(dir.into());
        self
    }

    pub fn instruction_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.instruction_path = Some(path.into());
        self
    }

    pub fn default_instruction(mut self, text: impl Into<String>) -> Self {
        self.config.default_instruction = text.into();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn sampling(mut self, sampling: SamplingConfig) -> Self {
        self.config.sampling = sampling;
        self
    }

    pub fn partial_policy(mut self, policy: PartialPolicy) -> Self {
        self.config.partial_policy = policy;
        self
    }

    pub fn clean_output(mut self, v: bool) -> Self {
        self.config.clean_output = v;
        self
    }

    pub fn pdf_renderer(mut self, renderer: Arc<dyn PdfRenderer>) -> Self {
        self.config.pdf_renderer = Some(renderer);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, Doc2TextError> {
        let c = &self.config;
        if c.max_pages == 0 {
            return Err(Doc2TextError::InvalidConfig("max_pages must be ≥ 1".into()));
        }
        if c.target_max_dimension == Some(0) {
            return Err(Doc2TextError::InvalidConfig(
                "target_max_dimension must be ≥ 1".into(),
            ));
        }
        if c.render_max_pixels < MIN_RENDER_PIXELS {
            return Err(Doc2TextError::InvalidConfig(format!(
                "render_max_pixels must be ≥ {MIN_RENDER_PIXELS}, got {}",
                c.render_max_pixels
            )));
        }
        if c.render_timeout_secs == 0 || c.download_timeout_secs == 0 {
            return Err(Doc2TextError::InvalidConfig(
                "render and download timeouts must be ≥ 1 second".into(),
            ));
        }
        c.sampling.validate()?;
        Ok(self.config)
    }
}

// ── Sampling ─────────────────────────────────────────────────────────────

/// Sampling parameters shared by both backends.
///
/// Immutable per request. Every field is validated independently by
/// [`SamplingConfig::validate`]; see [`SamplingParam`] for how a backend that
/// does not support a knob ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Range 0.0–2.0. Default: 0.7.
    pub temperature: f32,
    /// Range (0.0, 1.0]. Default: 0.8.
    pub top_p: f32,
    /// Range (0.0, 2.0]. Default: 1.05.
    pub repetition_penalty: f32,
    /// Range 0.0–2.0. Default: 0.0.
    pub frequency_penalty: f32,
    /// Range 0.0–2.0. Default: 0.0.
    pub presence_penalty: f32,
    /// Maximum generated tokens, ≥ 1. Default: 8000.
    pub max_tokens: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.8,
            repetition_penalty: 1.05,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            max_tokens: 8000,
        }
    }
}

impl SamplingConfig {
    /// Create a new builder starting from the defaults.
    pub fn builder() -> SamplingConfigBuilder {
        SamplingConfigBuilder {
            config: Self::default(),
        }
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<(), Doc2TextError> {
        check_range("temperature", self.temperature, 0.0, 2.0, true)?;
        check_range("top_p", self.top_p, 0.0, 1.0, false)?;
        check_range("repetition_penalty", self.repetition_penalty, 0.0, 2.0, false)?;
        check_range("frequency_penalty", self.frequency_penalty, 0.0, 2.0, true)?;
        check_range("presence_penalty", self.presence_penalty, 0.0, 2.0, true)?;
        if self.max_tokens == 0 {
            return Err(Doc2TextError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        Ok(())
    }

    /// Keep only the knobs a backend supports.
    ///
    /// Unsupported knobs become `None` in the returned request and are logged
    /// once at `warn` level. They never fail the request.
    pub fn project(&self, supported: &[SamplingParam]) -> SamplingRequest {
        let keep = |p: SamplingParam| {
            let ok = supported.contains(&p);
            if !ok {
                warn!("Sampling parameter '{}' is not supported by this backend; ignored", p.name());
            }
            ok
        };

        SamplingRequest {
            temperature: keep(SamplingParam::Temperature).then_some(self.temperature),
            top_p: keep(SamplingParam::TopP).then_some(self.top_p),
            repetition_penalty: keep(SamplingParam::RepetitionPenalty)
                .then_some(self.repetition_penalty),
            frequency_penalty: keep(SamplingParam::FrequencyPenalty)
                .then_some(self.frequency_penalty),
            presence_penalty: keep(SamplingParam::PresencePenalty)
                .then_some(self.presence_penalty),
            max_tokens: keep(SamplingParam::MaxTokens).then_some(self.max_tokens),
        }
    }
}

fn check_range(
    name: &str,
    value: f32,
    min: f32,
    max: f32,
    min_inclusive: bool,
) -> Result<(), Doc2TextError> {
    let above_min = if min_inclusive { value >= min } else { value > min };
    if !value.is_finite() || !above_min || value > max {
        let open = if min_inclusive { '[' } else { '(' };
        return Err(Doc2TextError::InvalidConfig(format!(
            "{name} must be in {open}{min}, {max}], got {value}"
        )));
    }
    Ok(())
}

/// Builder for [`SamplingConfig`].
#[derive(Debug)]
pub struct SamplingConfigBuilder {
    config: SamplingConfig,
}

impl SamplingConfigBuilder {
    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t;
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.config.top_p = p;
        self
    }

    pub fn repetition_penalty(mut self, p: f32) -> Self {
        self.config.repetition_penalty = p;
        self
    }

    pub fn frequency_penalty(mut self, p: f32) -> Self {
        self.config.frequency_penalty = p;
        self
    }

    pub fn presence_penalty(mut self, p: f32) -> Self {
        self.config.presence_penalty = p;
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    /// Build the sampling config, validating every field.
    pub fn build(self) -> Result<SamplingConfig, Doc2TextError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// One sampling knob, used to describe backend support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplingParam {
    Temperature,
    TopP,
    RepetitionPenalty,
    FrequencyPenalty,
    PresencePenalty,
    MaxTokens,
}

impl SamplingParam {
    pub const ALL: &'static [SamplingParam] = &[
        SamplingParam::Temperature,
        SamplingParam::TopP,
        SamplingParam::RepetitionPenalty,
        SamplingParam::FrequencyPenalty,
        SamplingParam::PresencePenalty,
        SamplingParam::MaxTokens,
    ];

    /// Wire name of the parameter.
    pub fn name(&self) -> &'static str {
        match self {
            SamplingParam::Temperature => "temperature",
            SamplingParam::TopP => "top_p",
            SamplingParam::RepetitionPenalty => "repetition_penalty",
            SamplingParam::FrequencyPenalty => "frequency_penalty",
            SamplingParam::PresencePenalty => "presence_penalty",
            SamplingParam::MaxTokens => "max_tokens",
        }
    }
}

/// Sampling parameters after projection onto one backend's capabilities.
///
/// Serialises to the OpenAI field names; `None` fields are omitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SamplingRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
}

// ── Backend settings ─────────────────────────────────────────────────────

/// Settings for the in-process engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedSettings {
    /// Model identifier handed to the engine loader.
    pub model: String,
    /// Prompt + generation token budget. Default: 25096.
    pub context_window: usize,
    /// Maximum images per prompt. Default: 4.
    pub image_limit: usize,
    /// The only directory `file://` references may point into.
    pub allowed_media_root: PathBuf,
    /// Tensor-parallel degree passed to the loader. Default: 1.
    pub tensor_parallel_size: usize,
    /// Weight dtype passed to the loader. Default: "bfloat16".
    pub dtype: String,
}

impl EmbeddedSettings {
    pub fn new(model: impl Into<String>, allowed_media_root: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            context_window: 25096,
            image_limit: 4,
            allowed_media_root: allowed_media_root.into(),
            tensor_parallel_size: 1,
            dtype: "bfloat16".to_string(),
        }
    }
}

/// Settings for an OpenAI-compatible streaming endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// Server base URL; a trailing `/v1` is accepted and normalised away.
    pub base_url: String,
    /// Served model name.
    pub model: String,
    /// Bearer token, if the server requires one.
    pub api_key: Option<String>,
    /// Timeout for the response to start and for each idle gap between chunks. Default: 600.
    pub timeout_secs: u64,
    /// Maximum images per prompt. Default: 6.
    pub image_limit: usize,
    /// Prompt + generation token budget, if known. Default: 26096.
    pub context_window: Option<usize>,
    /// Forward vLLM-only sampling fields (`repetition_penalty`). Default: true.
    pub vllm_extensions: bool,
}

impl RemoteSettings {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            timeout_secs: 600,
            image_limit: 6,
            context_window: Some(26096),
            vllm_extensions: true,
        }
    }
}

impl fmt::Debug for RemoteSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSettings")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .field("image_limit", &self.image_limit)
            .field("context_window", &self.context_window)
            .field("vllm_extensions", &self.vllm_extensions)
            .finish()
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How a page image is handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncodingMode {
    /// `file://` URL into the sandboxed media root. Only for trusted, co-located engines.
    LocalReference,
    /// Self-contained `data:` URI. Required for remote backends.
    Inline,
}

/// Image container used when serialising pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageFormat {
    /// Small payloads; the default for scanned receipts and statements.
    #[default]
    Jpeg,
    /// Lossless; better for fine print.
    Png,
}

impl PageFormat {
    pub fn image_format(&self) -> image::ImageFormat {
        match self {
            PageFormat::Jpeg => image::ImageFormat::Jpeg,
            PageFormat::Png => image::ImageFormat::Png,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            PageFormat::Jpeg => "jpg",
            PageFormat::Png => "png",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        self.image_format().to_mime_type()
    }
}

/// Policy for a stream that breaks after some text arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PartialPolicy {
    /// Surface [`Doc2TextError::StreamInterrupted`]. (default)
    #[default]
    AllOrNothing,
    /// Return the partial text, flagged `interrupted` and `truncated`.
    BestEffort,
}
