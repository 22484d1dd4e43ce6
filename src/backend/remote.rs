//! Remote backend: streaming chat completions against an OpenAI-compatible
//! server (vLLM, llama.cpp server, OpenAI itself).
//!
//! One [`reqwest::Client`] is built when the backend is constructed and reused
//! for every request; the client is read-only afterwards and safe to share.
//!
//! ## Timeouts
//!
//! `timeout_secs` bounds two waits separately: obtaining the response head,
//! and every idle gap between body chunks. A long generation that keeps
//! streaming never times out; a server that stalls does.

use crate::backend::delta::{DeltaStream, StreamEvent, StreamFault};
use crate::backend::sse::{SseDecoder, SseEvent};
use crate::config::{RemoteSettings, SamplingParam, SamplingRequest};
use crate::error::Doc2TextError;
use crate::pipeline::prompt::Message;
use futures::StreamExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

/// Sampling knobs every OpenAI-compatible server accepts.
const OPENAI_PARAMS: &[SamplingParam] = &[
    SamplingParam::Temperature,
    SamplingParam::TopP,
    SamplingParam::FrequencyPenalty,
    SamplingParam::PresencePenalty,
    SamplingParam::MaxTokens,
];

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    #[serde(flatten)]
    sampling: &'a SamplingRequest,
}

/// HTTP client for one OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    settings: RemoteSettings,
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteBackend {
    pub fn new(settings: RemoteSettings) -> Result<Self, Doc2TextError> {
        if settings.model.trim().is_empty() {
            return Err(Doc2TextError::InvalidConfig("remote model name is empty".into()));
        }
        if settings.image_limit == 0 {
            return Err(Doc2TextError::InvalidConfig("image_limit must be ≥ 1".into()));
        }
        let base = normalise_base_url(&settings.base_url);
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(Doc2TextError::InvalidConfig(format!(
                "remote base URL must be http(s), got '{}'",
                settings.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.timeout_secs.min(30)))
            .build()
            .map_err(|e| Doc2TextError::InvalidConfig(format!("HTTP client: {e}")))?;

        let endpoint = format!("{base}/v1/chat/completions");
        info!("Remote backend: {} (model {})", endpoint, settings.model);
        Ok(Self {
            settings,
            client,
            endpoint,
        })
    }

    pub fn settings(&self) -> &RemoteSettings {
        &self.settings
    }

    /// Full chat-completions URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// `repetition_penalty` is a vLLM extension; plain OpenAI servers reject it.
    pub fn supported_params(&self) -> &'static [SamplingParam] {
        if self.settings.vllm_extensions {
            SamplingParam::ALL
        } else {
            OPENAI_PARAMS
        }
    }

    /// Dispatch the request and return the delta stream once the server has
    /// accepted it.
    pub async fn generate_stream(
        &self,
        messages: &[Message],
        sampling: &SamplingRequest,
    ) -> Result<DeltaStream, Doc2TextError> {
        let timeout = Duration::from_secs(self.settings.timeout_secs);
        let body = ChatRequest {
            model: &self.settings.model,
            messages,
            stream: true,
            sampling,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.settings.api_key {
            request = request.bearer_auth(key);
        }

        debug!("POST {} ({} messages)", self.endpoint, messages.len());
        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| Doc2TextError::BackendTimeout {
                secs: self.settings.timeout_secs,
            })?
            .map_err(|e| {
                if e.is_timeout() {
                    Doc2TextError::BackendTimeout {
                        secs: self.settings.timeout_secs,
                    }
                } else {
                    Doc2TextError::BackendRejected {
                        status: None,
                        detail: format!("request to {} failed: {e}", self.endpoint),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = match tokio::time::timeout(timeout, response.text()).await {
                Ok(body) => truncate_detail(body.unwrap_or_default()),
                Err(_) => {
                    return Err(Doc2TextError::BackendTimeout {
                        secs: self.settings.timeout_secs,
                    })
                }
            };
            warn!("Backend returned HTTP {}: {}", status, text);
            return Err(Doc2TextError::BackendRejected {
                status: Some(status.as_u16()),
                detail: if text.is_empty() {
                    status.to_string()
                } else {
                    text
                },
            });
        }

        let endpoint = self.endpoint.clone();
        let events = sse_events(response.bytes_stream(), timeout);
        Ok(DeltaStream::new(events)
            .with_close_hook(move || debug!("Connection to {} released", endpoint)))
    }
}

/// Longest error body kept in `BackendRejected::detail`.
const MAX_ERROR_DETAIL: usize = 2048;

fn truncate_detail(mut text: String) -> String {
    if text.len() > MAX_ERROR_DETAIL {
        let mut cut = MAX_ERROR_DETAIL;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push('…');
    }
    text
}

/// Strip a trailing `/` and a trailing `/v1` so both `http://h:8000` and
/// `http://h:8000/v1/` map to the same endpoint.
pub fn normalise_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    trimmed
        .strip_suffix("/v1")
        .unwrap_or(trimmed)
        .trim_end_matches('/')
        .to_string()
}

struct SseState<S> {
    body: Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    idle_timeout: Duration,
    finish_sent: bool,
    ended: bool,
}

/// Turn an HTTP body of SSE bytes into stream events.
///
/// Ends after `[DONE]` or when the body ends; an EOF without the sentinel is
/// a normal end, logged at `warn`.
fn sse_events<S, B, E>(
    body: S,
    idle_timeout: Duration,
) -> impl Stream<Item = Result<StreamEvent, StreamFault>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = SseState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        idle_timeout,
        finish_sent: false,
        ended: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                match event {
                    SseEvent::Delta(text) => return Some((Ok(StreamEvent::Delta(text)), st)),
                    SseEvent::Finish(reason) => {
                        st.finish_sent = true;
                        let ev = StreamEvent::Finished {
                            reason: Some(reason),
                        };
                        return Some((Ok(ev), st));
                    }
                    SseEvent::Done => {
                        st.ended = true;
                        st.pending.clear();
                        if st.finish_sent {
                            return None;
                        }
                        st.finish_sent = true;
                        return Some((Ok(StreamEvent::Finished { reason: None }), st));
                    }
                }
            }
            if st.ended {
                return None;
            }

            match tokio::time::timeout(st.idle_timeout, st.body.next()).await {
                Err(_) => {
                    st.ended = true;
                    let secs = st.idle_timeout.as_secs();
                    return Some((Err(StreamFault::Fatal(Doc2TextError::BackendTimeout { secs })), st));
                }
                Ok(Some(Ok(bytes))) => match st.decoder.push(bytes.as_ref()) {
                    Ok(events) => st.pending.extend(events),
                    Err(e) => {
                        st.ended = true;
                        return Some((Err(StreamFault::Fatal(e)), st));
                    }
                },
                Ok(Some(Err(e))) => {
                    st.ended = true;
                    return Some((Err(StreamFault::Transport(e.to_string())), st));
                }
                Ok(None) => {
                    st.ended = true;
                    match st.decoder.finish() {
                        Ok(events) => st.pending.extend(events),
                        Err(e) => return Some((Err(StreamFault::Fatal(e)), st)),
                    }
                    if !st.decoder.is_done() && !st.finish_sent {
                        warn!("Stream closed without a completion sentinel; treating as end of output");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sse::FinishReason;

    #[test]
    fn base_url_normalisation() {
        assert_eq!(normalise_base_url("http://h:8000"), "http://h:8000");
        assert_eq!(normalise_base_url("http://h:8000/"), "http://h:8000");
        assert_eq!(normalise_base_url("http://h:8000/v1"), "http://h:8000");
        assert_eq!(normalise_base_url("http://h:8000/v1/"), "http://h:8000");
        assert_eq!(normalise_base_url(" https://api.x.com/proxy/v1 "), "https://api.x.com/proxy");
    }

    #[test]
    fn endpoint_and_param_support() {
        let b = RemoteBackend::new(RemoteSettings::new("http://localhost:8000/v1", "qwen")).unwrap();
        assert_eq!(b.endpoint(), "http://localhost:8000/v1/chat/completions");
        assert!(b.supported_params().contains(&SamplingParam::RepetitionPenalty));

        let mut s = RemoteSettings::new("http://localhost:8000", "gpt");
        s.vllm_extensions = false;
        let b = RemoteBackend::new(s).unwrap();
        assert!(!b.supported_params().contains(&SamplingParam::RepetitionPenalty));
    }

    #[test]
    fn rejects_bad_settings() {
        assert!(RemoteBackend::new(RemoteSettings::new("localhost:8000", "m")).is_err());
        assert!(RemoteBackend::new(RemoteSettings::new("http://h", " ")).is_err());
    }

    #[test]
    fn request_body_flattens_sampling() {
        let sampling = SamplingRequest {
            temperature: Some(0.0),
            max_tokens: Some(16),
            ..Default::default()
        };
        let body = ChatRequest {
            model: "m",
            messages: &[],
            stream: true,
            sampling: &sampling,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["temperature"], 0.0);
        assert_eq!(json["max_tokens"], 16);
        assert!(json.get("top_p").is_none());
    }

    fn body(parts: Vec<Result<&'static str, String>>) -> impl Stream<Item = Result<&'static [u8], String>> + Send {
        futures::stream::iter(parts.into_iter().map(|p| p.map(str::as_bytes)))
    }

    #[tokio::test]
    async fn events_end_after_done() {
        let parts = vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"Tot\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"al\"},"),
            Ok("\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n"),
        ];
        let events: Vec<_> = sse_events(body(parts), Duration::from_secs(5))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("Tot".into()),
                StreamEvent::Delta("al".into()),
                StreamEvent::Finished {
                    reason: Some(FinishReason::Stop)
                },
            ]
        );
    }

    #[tokio::test]
    async fn eof_without_done_just_ends() {
        let parts = vec![Ok("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n")];
        let events: Vec<_> = sse_events(body(parts), Duration::from_secs(5)).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ok(StreamEvent::Delta(t)) if t == "x"));
    }

    #[tokio::test]
    async fn body_error_is_transport_fault() {
        let parts = vec![
            Ok("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n"),
            Err("connection reset".to_string()),
        ];
        let events: Vec<_> = sse_events(body(parts), Duration::from_secs(5)).collect().await;
        assert!(matches!(events.last(), Some(Err(StreamFault::Transport(d))) if d.contains("reset")));
    }

    #[tokio::test]
    async fn idle_gap_times_out() {
        let stalled = futures::stream::pending::<Result<&'static [u8], String>>();
        let events: Vec<_> = sse_events(stalled, Duration::from_millis(50)).collect().await;
        assert!(matches!(
            events.as_slice(),
            [Err(StreamFault::Fatal(Doc2TextError::BackendTimeout { .. }))]
        ));
    }
}
