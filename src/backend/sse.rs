//! Server-sent-events decoder for OpenAI-compatible chat-completion streams.
//!
//! The server sends lines of the form
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Tot"},"finish_reason":null}]}
//!
//! data: {"choices":[{"delta":{},"finish_reason":"stop"}]}
//!
//! data: [DONE]
//! ```
//!
//! HTTP chunks do not respect line (or UTF-8) boundaries, so bytes are
//! buffered until a full `\n`-terminated line is available and only then
//! decoded. The decoder is pure: [`SseDecoder::push`] takes bytes and returns
//! events, which keeps it testable without a socket.

use crate::error::Doc2TextError;
use serde::Deserialize;
use tracing::{debug, warn};

/// Why generation stopped, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural stop (end-of-sequence or stop string).
    Stop,
    /// `max_tokens` reached.
    Length,
    /// Anything else the server reports (e.g. `content_filter`).
    Other(String),
}

impl FinishReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" | "eos" => FinishReason::Stop,
            "length" => FinishReason::Length,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn is_truncation(&self) -> bool {
        matches!(self, FinishReason::Length)
    }
}

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// Text appended by the model; may be empty.
    Delta(String),
    /// The server reported a finish reason for the first choice.
    Finish(FinishReason),
    /// The `[DONE]` sentinel.
    Done,
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ErrorPayload>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

/// Incremental SSE line decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `[DONE]` has been seen; later bytes are ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes and return every event completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, Doc2TextError> {
        if self.done {
            return Ok(Vec::new());
        }
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.decode_line(&line[..line.len() - 1], &mut events)?;
            if self.done {
                self.buf.clear();
                break;
            }
        }
        Ok(events)
    }

    /// Flush a final unterminated line at end of stream.
    pub fn finish(&mut self) -> Result<Vec<SseEvent>, Doc2TextError> {
        let mut events = Vec::new();
        if !self.done && !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.decode_line(&line, &mut events)?;
        }
        Ok(events)
    }

    fn decode_line(&mut self, raw: &[u8], out: &mut Vec<SseEvent>) -> Result<(), Doc2TextError> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);

        // Blank lines separate events; `:` lines are comments / keep-alives.
        if line.is_empty() || line.starts_with(':') {
            return Ok(());
        }
        let Some(data) = line.strip_prefix("data:") else {
            debug!("SSE: ignoring non-data line '{}'", line);
            return Ok(());
        };
        let data = data.trim();

        if data == "[DONE]" {
            self.done = true;
            out.push(SseEvent::Done);
            return Ok(());
        }

        let payload: ChunkPayload = serde_json::from_str(data).map_err(|e| {
            Doc2TextError::BackendRejected {
                status: None,
                detail: format!("malformed stream chunk ({e}): {}", truncate(data, 200)),
            }
        })?;

        if let Some(err) = payload.error {
            let code = err.code.map(|c| format!(" [{c}]")).unwrap_or_default();
            return Err(Doc2TextError::BackendRejected {
                status: None,
                detail: format!(
                    "{}{}",
                    err.message.unwrap_or_else(|| "unknown error".into()),
                    code
                ),
            });
        }

        let Some(choice) = payload.choices.into_iter().next() else {
            // Usage-only chunks carry no choices.
            return Ok(());
        };
        if let Some(content) = choice.delta.and_then(|d| d.content) {
            out.push(SseEvent::Delta(content));
        }
        if let Some(reason) = choice.finish_reason {
            let reason = FinishReason::parse(&reason);
            if reason.is_truncation() {
                warn!("Generation stopped at max_tokens; output is truncated");
            }
            out.push(SseEvent::Finish(reason));
        }
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
