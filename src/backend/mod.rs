//! Inference backends.
//!
//! [`Backend`] is a closed, two-variant enum: an in-process
//! [`EmbeddedBackend`] or an HTTP [`RemoteBackend`]. Both take the same
//! [`Message`] list and [`SamplingConfig`] and produce the same result shapes,
//! either eagerly ([`Backend::generate`] → [`InferenceResult`]) or lazily
//! ([`Backend::generate_stream`] → [`DeltaStream`]).
//!
//! A backend is process-wide: build it once at startup, wrap it in a
//! [`BackendHandle`], and pass the handle to every request. Nothing in a
//! request mutates it.
//!
//! Before dispatch, every call
//! 1. projects the sampling config onto the parameters the variant supports
//!    (unsupported ones are ignored with a warning), and
//! 2. checks the estimated prompt size plus `max_tokens` against the context
//!    window, failing with [`Doc2TextError::ContextLengthExceeded`].

pub mod delta;
pub mod embedded;
pub mod remote;
pub mod sse;

pub use delta::{DeltaStream, StreamEvent, StreamFault};
pub use embedded::{EmbeddedBackend, EngineLoader, EngineOutput, InitOutcome, LocalEngine};
pub use remote::RemoteBackend;
pub use sse::FinishReason;

use crate::collect::{collect_stream, CancelToken};
use crate::config::{EmbeddedSettings, EncodingMode, RemoteSettings, SamplingConfig, SamplingParam};
use crate::error::Doc2TextError;
use crate::pipeline::prompt::{estimate_prompt_tokens, Message};
use crate::pipeline::sandbox::Sandbox;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared, read-only handle passed into every request.
pub type BackendHandle = Arc<Backend>;

/// Which variant a [`Backend`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Embedded,
    Remote,
}

/// Final result of one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceResult {
    pub text: String,
    /// The backend signalled completion.
    pub finished: bool,
    /// Generation stopped at `max_tokens` rather than a natural stop.
    pub truncated: bool,
}

#[derive(Debug)]
pub enum Backend {
    Embedded(EmbeddedBackend),
    Remote(RemoteBackend),
}

impl Backend {
    /// Build an embedded backend. The engine still has to be loaded with
    /// [`EmbeddedBackend::initialize`].
    pub fn embedded(settings: EmbeddedSettings) -> Result<Self, Doc2TextError> {
        Ok(Backend::Embedded(EmbeddedBackend::new(settings)?))
    }

    pub fn remote(settings: RemoteSettings) -> Result<Self, Doc2TextError> {
        Ok(Backend::Remote(RemoteBackend::new(settings)?))
    }

    pub fn into_handle(self) -> BackendHandle {
        Arc::new(self)
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Embedded(_) => BackendKind::Embedded,
            Backend::Remote(_) => BackendKind::Remote,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Backend::Embedded(b) => &b.settings().model,
            Backend::Remote(b) => &b.settings().model,
        }
    }

    /// Maximum images accepted in one prompt.
    pub fn image_limit(&self) -> usize {
        match self {
            Backend::Embedded(b) => b.settings().image_limit,
            Backend::Remote(b) => b.settings().image_limit,
        }
    }

    /// Prompt + generation token budget, when known.
    pub fn context_window(&self) -> Option<usize> {
        match self {
            Backend::Embedded(b) => Some(b.settings().context_window),
            Backend::Remote(b) => b.settings().context_window,
        }
    }

    /// The sandbox for `file://` references; only co-located engines have one.
    pub fn sandbox(&self) -> Option<&Sandbox> {
        match self {
            Backend::Embedded(b) => Some(b.sandbox()),
            Backend::Remote(_) => None,
        }
    }

    /// Pick the encoding for this backend.
    ///
    /// A remote server never shares our filesystem, so it only ever receives
    /// inline data; asking for local references there is a config error.
    pub fn resolve_encoding(
        &self,
        requested: Option<EncodingMode>,
    ) -> Result<EncodingMode, Doc2TextError> {
        match (self, requested) {
            (Backend::Remote(_), Some(EncodingMode::LocalReference)) => {
                Err(Doc2TextError::InvalidConfig(
                    "local-reference encoding is not available for a remote backend".into(),
                ))
            }
            (Backend::Remote(_), _) => Ok(EncodingMode::Inline),
            (Backend::Embedded(_), Some(mode)) => Ok(mode),
            (Backend::Embedded(_), None) => Ok(EncodingMode::LocalReference),
        }
    }

    pub fn supported_params(&self) -> &'static [SamplingParam] {
        match self {
            Backend::Embedded(b) => b.supported_params(),
            Backend::Remote(b) => b.supported_params(),
        }
    }

    /// Estimate prompt tokens and compare against the context window.
    ///
    /// Returns the estimate on success. Backends without a known window only
    /// get the estimate.
    pub fn check_context(
        &self,
        messages: &[Message],
        sampling: &SamplingConfig,
    ) -> Result<usize, Doc2TextError> {
        let prompt_tokens = estimate_prompt_tokens(messages);
        match self.context_window() {
            Some(window) if prompt_tokens.saturating_add(sampling.max_tokens) > window => {
                warn!(
                    "Prompt ~{} tokens + max_tokens {} exceeds context window {}",
                    prompt_tokens, sampling.max_tokens, window
                );
                Err(Doc2TextError::ContextLengthExceeded {
                    prompt_tokens,
                    max_tokens: sampling.max_tokens,
                    context_window: window,
                })
            }
            _ => {
                debug!("Prompt estimate: ~{} tokens", prompt_tokens);
                Ok(prompt_tokens)
            }
        }
    }

    /// Generate the full response.
    pub async fn generate(
        &self,
        messages: &[Message],
        sampling: &SamplingConfig,
    ) -> Result<InferenceResult, Doc2TextError> {
        self.check_context(messages, sampling)?;
        let request = sampling.project(self.supported_params());
        match self {
            Backend::Embedded(b) => {
                let out = b.generate(messages, &request).await?;
                Ok(InferenceResult {
                    text: out.text,
                    finished: true,
                    truncated: out.finish.is_truncation(),
                })
            }
            Backend::Remote(b) => {
                let stream = b.generate_stream(messages, &request).await?;
                let collected = collect_stream(stream, &CancelToken::new(), None).await?;
                Ok(InferenceResult {
                    text: collected.full_text,
                    finished: collected.finished,
                    truncated: collected.truncated,
                })
            }
        }
    }

    /// Generate lazily, one delta at a time.
    ///
    /// The embedded engine has no incremental output; its stream yields the
    /// whole text as a single delta.
    pub async fn generate_stream(
        &self,
        messages: &[Message],
        sampling: &SamplingConfig,
    ) -> Result<DeltaStream, Doc2TextError> {
        self.check_context(messages, sampling)?;
        let request = sampling.project(self.supported_params());
        match self {
            Backend::Embedded(b) => {
                let out = b.generate(messages, &request).await?;
                Ok(DeltaStream::from_complete(out.text, Some(out.finish)))
            }
            Backend::Remote(b) => b.generate_stream(messages, &request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::prompt::{ContentPart, ImageUrl, Role};

    fn remote() -> Backend {
        Backend::remote(RemoteSettings::new("http://localhost:8000", "m")).unwrap()
    }

    #[test]
    fn remote_always_uses_inline() {
        let b = remote();
        assert_eq!(b.resolve_encoding(None).unwrap(), EncodingMode::Inline);
        assert_eq!(
            b.resolve_encoding(Some(EncodingMode::Inline)).unwrap(),
            EncodingMode::Inline
        );
        assert!(b.resolve_encoding(Some(EncodingMode::LocalReference)).is_err());
        assert!(b.sandbox().is_none());
    }

    #[test]
    fn embedded_defaults_to_local_reference() {
        let dir = tempfile::tempdir().unwrap();
        let b = Backend::embedded(EmbeddedSettings::new("m", dir.path())).unwrap();
        assert_eq!(b.resolve_encoding(None).unwrap(), EncodingMode::LocalReference);
        assert_eq!(b.kind(), BackendKind::Embedded);
        assert_eq!(b.image_limit(), 4);
        assert!(b.sandbox().is_some());
    }

    #[test]
    fn context_overflow_is_detected_before_dispatch() {
        let mut settings = RemoteSettings::new("http://localhost:8000", "m");
        settings.context_window = Some(2000);
        let b = Backend::remote(settings).unwrap();

        // 1000×1000 px → 36×36 patches + 2 = 1298 tokens.
        let messages = vec![Message {
            role: Role::User,
            content: vec![ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:".into(),
                    dimensions: Some((1000, 1000)),
                },
            }],
        }];
        let sampling = SamplingConfig::builder().max_tokens(1000).build().unwrap();
        let err = b.check_context(&messages, &sampling).unwrap_err();
        assert!(matches!(
            err,
            Doc2TextError::ContextLengthExceeded {
                context_window: 2000,
                max_tokens: 1000,
                ..
            }
        ));

        let small = SamplingConfig::builder().max_tokens(100).build().unwrap();
        assert!(b.check_context(&messages, &small).is_ok());
    }

    #[test]
    fn huge_max_tokens_does_not_wrap_past_the_window() {
        let mut settings = RemoteSettings::new("http://localhost:8000", "m");
        settings.context_window = Some(2000);
        let b = Backend::remote(settings).unwrap();
        let messages = vec![Message::system("hello")];
        let sampling = SamplingConfig::builder().max_tokens(usize::MAX).build().unwrap();
        let err = b.check_context(&messages, &sampling).unwrap_err();
        assert!(matches!(err, Doc2TextError::ContextLengthExceeded { .. }));
    }

    #[test]
    fn unknown_window_only_estimates() {
        let mut settings = RemoteSettings::new("http://localhost:8000", "m");
        settings.context_window = None;
        let b = Backend::remote(settings).unwrap();
        let messages = vec![Message::system("hello")];
        assert!(b.check_context(&messages, &SamplingConfig::default()).is_ok());
    }
}
