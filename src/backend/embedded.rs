//! Embedded backend: an in-process engine that owns the model weights.
//!
//! The engine itself (weights, tokenizer, generation loop) is an external
//! collaborator reached through two traits:
//!
//! * [`EngineLoader`] loads weights once from [`EmbeddedSettings`].
//! * [`LocalEngine`] is a blocking `generate(messages, sampling)` call.
//!
//! [`EmbeddedBackend::initialize`] runs the loader at most once for the
//! lifetime of the backend. A second call is reported as
//! [`InitOutcome::AlreadyLoaded`] and never loads weights twice. Generation
//! runs on tokio's blocking pool so the async runtime keeps serving other
//! requests while the engine works.

use crate::backend::sse::FinishReason;
use crate::config::{EmbeddedSettings, SamplingParam, SamplingRequest};
use crate::error::Doc2TextError;
use crate::pipeline::prompt::Message;
use crate::pipeline::sandbox::Sandbox;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// What a [`LocalEngine`] returns for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    pub text: String,
    pub finish: FinishReason,
}

/// A loaded, in-process vision-language model.
///
/// `generate` blocks the calling thread. Implementations may batch
/// concurrent calls internally; callers see one blocking call per request and
/// no implicit retries.
pub trait LocalEngine: Send + Sync {
    fn generate(
        &self,
        messages: &[Message],
        sampling: &SamplingRequest,
    ) -> Result<EngineOutput, Doc2TextError>;

    /// Sampling knobs this engine honours. Default: all of them.
    fn supported_params(&self) -> &'static [SamplingParam] {
        SamplingParam::ALL
    }
}

/// Loads a [`LocalEngine`] from settings. Called at most once per backend.
pub trait EngineLoader {
    fn load(&self, settings: &EmbeddedSettings) -> Result<Arc<dyn LocalEngine>, Doc2TextError>;
}

/// Result of [`EmbeddedBackend::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// This call loaded the engine.
    Loaded,
    /// The engine was already loaded; the loader was not called.
    AlreadyLoaded,
}

pub struct EmbeddedBackend {
    settings: EmbeddedSettings,
    sandbox: Sandbox,
    engine: OnceCell<Arc<dyn LocalEngine>>,
}

impl EmbeddedBackend {
    /// Validate settings and resolve the allowed media root. Does not load weights.
    pub fn new(settings: EmbeddedSettings) -> Result<Self, Doc2TextError> {
        if settings.image_limit == 0 {
            return Err(Doc2TextError::InvalidConfig("image_limit must be ≥ 1".into()));
        }
        if settings.context_window == 0 {
            return Err(Doc2TextError::InvalidConfig("context_window must be ≥ 1".into()));
        }
        let sandbox = Sandbox::new(&settings.allowed_media_root)?;
        Ok(Self {
            settings,
            sandbox,
            engine: OnceCell::new(),
        })
    }

    pub fn settings(&self) -> &EmbeddedSettings {
        &self.settings
    }

    /// Guard for every `file://` reference handed to this engine.
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.get().is_some()
    }

    /// Load the engine if it is not loaded yet.
    ///
    /// Concurrent callers block until the first load finishes; exactly one
    /// of them sees [`InitOutcome::Loaded`]. A failed load leaves the backend
    /// uninitialised so a later call may try again.
    pub fn initialize(&self, loader: &dyn EngineLoader) -> Result<InitOutcome, Doc2TextError> {
        let mut loaded_here = false;
        self.engine.get_or_try_init(|| {
            loaded_here = true;
            info!(
                "Loading embedded model '{}' (tp={}, dtype={})",
                self.settings.model, self.settings.tensor_parallel_size, self.settings.dtype
            );
            loader.load(&self.settings)
        })?;

        if loaded_here {
            info!("Embedded model '{}' ready", self.settings.model);
            Ok(InitOutcome::Loaded)
        } else {
            debug!("Embedded model '{}' already loaded; skipping", self.settings.model);
            Ok(InitOutcome::AlreadyLoaded)
        }
    }

    pub fn supported_params(&self) -> &'static [SamplingParam] {
        self.engine
            .get()
            .map(|e| e.supported_params())
            .unwrap_or(SamplingParam::ALL)
    }

    fn engine(&self) -> Result<Arc<dyn LocalEngine>, Doc2TextError> {
        self.engine
            .get()
            .cloned()
            .ok_or_else(|| Doc2TextError::BackendNotInitialized {
                model: self.settings.model.clone(),
            })
    }

    /// Run one blocking generation on the blocking pool.
    pub async fn generate(
        &self,
        messages: &[Message],
        sampling: &SamplingRequest,
    ) -> Result<EngineOutput, Doc2TextError> {
        let engine = self.engine()?;
        let messages = messages.to_vec();
        let sampling = *sampling;

        tokio::task::spawn_blocking(move || engine.generate(&messages, &sampling))
            .await
            .map_err(|e| Doc2TextError::Internal(format!("Engine task panicked: {}", e)))?
    }
}

impl fmt::Debug for EmbeddedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedBackend")
            .field("settings", &self.settings)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
