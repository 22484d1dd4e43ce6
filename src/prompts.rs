//! Instruction loading and built-in prompt text.
//!
//! The instruction is the user-facing task ("extract every transaction…").
//! It is loaded once per request from a text file and never mutated after
//! that. When the file is absent the pipeline keeps working with
//! [`DEFAULT_INSTRUCTION`], but the substitution is logged at `warn` level
//! and recorded in [`Instruction::source`] so it can never be mistaken for a
//! user-supplied instruction.

use crate::error::Doc2TextError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Instruction used when no instruction file is available.
pub const DEFAULT_INSTRUCTION: &str =
    "Extract all of the structured information from this document.";

/// Optional system prompt describing the assistant's behaviour.
///
/// Not sent unless the caller opts in via
/// [`crate::config::ExtractionConfig::system_prompt`].
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a meticulous document-understanding assistant.

You receive one or more page images of a single document, in page order,
followed by an instruction.

- Read every page before answering.
- Copy numbers, dates, and amounts exactly as printed.
- If a requested field is not present, say so instead of guessing.
- Output ONLY the requested content, in the format the instruction asks for.
- Do NOT add commentary or explanations."#;

/// Where an [`Instruction`]'s text came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum InstructionSource {
    /// Read from this file.
    File(PathBuf),
    /// Built-in fallback; the pipeline ran in degraded mode.
    Default,
}

/// Immutable instruction text plus its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    text: String,
    source: InstructionSource,
}

impl Instruction {
    /// Instruction text that was read from `path`.
    pub fn from_file_contents(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: InstructionSource::File(path.into()),
        }
    }

    /// The fallback instruction.
    pub fn fallback(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: InstructionSource::Default,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn source(&self) -> &InstructionSource {
        &self.source
    }

    /// True when the built-in fallback is in use.
    pub fn is_fallback(&self) -> bool {
        self.source == InstructionSource::Default
    }
}

/// Load the instruction from `path`, falling back to `default` when the file is absent.
///
/// Only absence triggers the fallback. A file that exists but cannot be read
/// (permissions, invalid UTF-8) is an error: silently replacing an
/// instruction the operator *meant* to supply would produce plausible but
/// wrong output.
pub async fn load_instruction(
    path: Option<&Path>,
    default: &str,
) -> Result<Instruction, Doc2TextError> {
    let Some(path) = path else {
        warn!("No instruction file configured; using the default instruction");
        return Ok(Instruction::fallback(default));
    };

    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            debug!("Loaded instruction from {} ({} chars)", path.display(), text.len());
            Ok(Instruction::from_file_contents(path, text))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "Instruction file '{}' not found; using the default instruction",
                path.display()
            );
            Ok(Instruction::fallback(default))
        }
        Err(source) => Err(Doc2TextError::InstructionUnreadable {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_falls_back_observably() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.md");
        let instr = load_instruction(Some(&missing), DEFAULT_INSTRUCTION)
            .await
            .unwrap();
        assert!(instr.is_fallback());
        assert_eq!(instr.text(), DEFAULT_INSTRUCTION);
        assert_eq!(instr.source(), &InstructionSource::Default);
    }

    #[tokio::test]
    async fn no_path_falls_back() {
        let instr = load_instruction(None, "custom default").await.unwrap();
        assert!(instr.is_fallback());
        assert_eq!(instr.text(), "custom default");
    }

    #[tokio::test]
    async fn existing_file_is_used_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instr.md");
        std::fs::write(&path, "List every transaction as YAML.\n").unwrap();

        let instr = load_instruction(Some(&path), DEFAULT_INSTRUCTION)
            .await
            .unwrap();
        assert!(!instr.is_fallback());
        assert_eq!(instr.text(), "List every transaction as YAML.\n");
        assert_eq!(instr.source(), &InstructionSource::File(path));
    }

    #[tokio::test]
    async fn directory_path_is_an_error_not_a_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_instruction(Some(dir.path()), DEFAULT_INSTRUCTION)
            .await
            .unwrap_err();
        assert!(matches!(err, Doc2TextError::InstructionUnreadable { .. }));
    }

    #[test]
    fn source_serialises_with_kind_tag() {
        let json = serde_json::to_value(InstructionSource::Default).unwrap();
        assert_eq!(json["kind"], "default");
    }
}
