//! Remote backend integration tests.
//!
//! Uses wiremock to stand in for an OpenAI-compatible server (vLLM) that
//! answers `/v1/chat/completions` with a server-sent-event stream.

use edgequake_doc2text::{
    collect_stream, extract, extract_with_cancel, Backend, CancelToken, Doc2TextError,
    DeltaStream, EncodingMode, ExtractionConfig, ExtractionProgressCallback, PartialPolicy,
    RemoteSettings, StreamEvent, StreamFault,
};
use image::{DynamicImage, Rgb, RgbImage};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::{assert_err, assert_ok};
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

// ── Helpers ──────────────────────────────────────────────────────────────────

const MODEL: &str = "Qwen/Qwen2.5-VL-7B-Instruct";

fn chunk(content: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({
            "choices": [{ "index": 0, "delta": { "content": content }, "finish_reason": null }]
        })
    )
}

fn finish(reason: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({
            "choices": [{ "index": 0, "delta": {}, "finish_reason": reason }]
        })
    )
}

fn sse_body(deltas: &[&str], reason: &str) -> String {
    let mut body: String = deltas.iter().map(|d| chunk(d)).collect();
    body.push_str(&finish(reason));
    body.push_str("data: [DONE]\n\n");
    body
}

fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "text/event-stream")
}

/// A small receipt image on disk; images skip pdfium entirely.
fn receipt(dir: &TempDir) -> PathBuf {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(56, 84, Rgb([250, 250, 250])));
    let path = dir.path().join("receipt.png");
    img.save(&path).unwrap();
    path
}

fn remote(server: &MockServer) -> Backend {
    Backend::remote(RemoteSettings::new(server.uri(), MODEL)).unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What a [`scripted_server`] does after reading the request.
enum Step {
    /// Write raw bytes.
    Send(String),
    /// Keep the socket open without writing anything.
    Stall,
}

const SSE_HEAD: &str = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";

/// One HTTP/1.1 chunk of a chunked body.
fn http_chunk(data: &str) -> String {
    format!("{:x}\r\n{}\r\n", data.len(), data)
}

/// A one-shot HTTP server that replays `steps` on the first connection and
/// then drops it. Lets tests break or stall a response at an exact byte.
async fn scripted_server(steps: Vec<Step>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        for step in steps {
            match step {
                Step::Send(bytes) => {
                    socket.write_all(bytes.as_bytes()).await.unwrap();
                    socket.flush().await.unwrap();
                }
                Step::Stall => tokio::time::sleep(Duration::from_secs(60)).await,
            }
        }
    });
    format!("http://{addr}")
}

/// Consume the request head and its `content-length` body.
async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + len {
                return;
            }
        }
    }
}

fn remote_at(base_url: String, timeout_secs: u64) -> Backend {
    let mut settings = RemoteSettings::new(base_url, MODEL);
    settings.timeout_secs = timeout_secs;
    Backend::remote(settings).unwrap()
}

/// Sends "Total: $12" and then resets the connection mid-body.
async fn breaking_server() -> String {
    scripted_server(vec![
        Step::Send(SSE_HEAD.to_string()),
        Step::Send(http_chunk(&chunk("Total: "))),
        Step::Send(http_chunk(&chunk("$12"))),
    ])
    .await
}

#[derive(Default)]
struct DeltaRecorder {
    deltas: Mutex<Vec<String>>,
}

impl ExtractionProgressCallback for DeltaRecorder {
    fn on_delta(&self, delta: &str) {
        self.deltas.lock().unwrap().push(delta.to_string());
    }
}

// ── Streaming ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn deltas_are_concatenated_in_arrival_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse_response(sse_body(&["Tot", "al: $", "12.50"], "stop")))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let input = receipt(&dir);
    let recorder = Arc::new(DeltaRecorder::default());
    let config = ExtractionConfig::builder()
        .progress_callback(recorder.clone())
        .build()
        .unwrap();

    let output = extract(input.to_str().unwrap(), &config, &remote(&server))
        .await
        .unwrap();

    assert_eq!(output.text, "Total: $12.50");
    assert!(!output.truncated);
    assert!(output.finished);
    assert!(!output.cancelled);
    assert_eq!(*recorder.deltas.lock().unwrap(), vec!["Tot", "al: $", "12.50"]);
}

#[tokio::test]
async fn length_finish_reason_sets_truncated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse_response(sse_body(&["items:\n", "  - coffee"], "length")))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let output = extract(
        receipt(&dir).to_str().unwrap(),
        &ExtractionConfig::default(),
        &remote(&server),
    )
    .await
    .unwrap();

    assert_eq!(output.text, "items:\n  - coffee");
    assert!(output.truncated);
}

#[tokio::test]
async fn request_carries_inline_image_then_instruction() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(serde_json::json!({
            "model": MODEL,
            "stream": true,
            "max_tokens": 8000
        })))
        .respond_with(sse_response(sse_body(&["ok"], "stop")))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let instruction = dir.path().join("instruction.txt");
    std::fs::write(&instruction, "Extract the total.").unwrap();

    let mut settings = RemoteSettings::new(format!("{}/v1/", server.uri()), MODEL);
    settings.api_key = Some("sk-test".into());
    let backend = Backend::remote(settings).unwrap();
    let config = ExtractionConfig::builder()
        .instruction_path(&instruction)
        .build()
        .unwrap();

    let output = extract(receipt(&dir).to_str().unwrap(), &config, &backend)
        .await
        .unwrap();
    assert_eq!(output.text, "ok");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    let content = &body["messages"][0]["content"];
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(content.as_array().unwrap().len(), 2);
    assert_eq!(content[0]["type"], "image_url");
    assert!(content[0]["image_url"]["url"]
        .as_str()
        .unwrap()
        .starts_with("data:image/jpeg;base64,"));
    assert_eq!(content[1]["type"], "text");
    assert_eq!(content[1]["text"], "Extract the total.");
    let penalty = body["repetition_penalty"].as_f64().unwrap();
    assert!((penalty - 1.05).abs() < 1e-6);
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn http_error_is_backend_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("engine overloaded"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let err = extract(
        receipt(&dir).to_str().unwrap(),
        &ExtractionConfig::default(),
        &remote(&server),
    )
    .await
    .unwrap_err();

    match err {
        Doc2TextError::BackendRejected { status, detail } => {
            assert_eq!(status, Some(500));
            assert!(detail.contains("engine overloaded"));
        }
        other => panic!("expected BackendRejected, got {other:?}"),
    }
}

#[tokio::test]
async fn prompt_over_context_window_never_reaches_the_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse_response(sse_body(&["unused"], "stop")))
        .expect(0)
        .mount(&server)
        .await;

    let mut settings = RemoteSettings::new(server.uri(), MODEL);
    settings.context_window = Some(1000);
    let backend = Backend::remote(settings).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let err = extract(
        receipt(&dir).to_str().unwrap(),
        &ExtractionConfig::default(),
        &backend,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Doc2TextError::ContextLengthExceeded { .. }));
}

#[tokio::test]
async fn local_references_are_refused_for_remote_servers() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = ExtractionConfig::builder()
        .encoding(EncodingMode::LocalReference)
        .build()
        .unwrap();

    let err = extract(receipt(&dir).to_str().unwrap(), &config, &remote(&server))
        .await
        .unwrap_err();
    assert!(matches!(err, Doc2TextError::InvalidConfig(_)));
}

#[tokio::test]
async fn stream_without_done_still_ends_cleanly() {
    let server = MockServer::start().await;
    let body = format!("{}{}", chunk("Total"), finish("stop"));
    Mock::given(method("POST"))
        .respond_with(sse_response(body))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let output = extract(
        receipt(&dir).to_str().unwrap(),
        &ExtractionConfig::default(),
        &remote(&server),
    )
    .await
    .unwrap();
    assert_eq!(output.text, "Total");
    assert!(output.finished);
}

#[tokio::test]
async fn slow_response_head_is_a_timeout() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse_response(sse_body(&["late"], "stop")).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let result = extract(
        receipt(&dir).to_str().unwrap(),
        &ExtractionConfig::default(),
        &remote_at(server.uri(), 1),
    )
    .await;
    let err = assert_err!(result);
    assert!(matches!(err, Doc2TextError::BackendTimeout { secs: 1 }), "got {err:?}");
}

#[tokio::test]
async fn stalled_error_body_is_a_timeout() {
    init_tracing();
    let base = scripted_server(vec![
        Step::Send("HTTP/1.1 503 Service Unavailable\r\ncontent-length: 100\r\n\r\nwarming".into()),
        Step::Stall,
    ])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let input = receipt(&dir);
    let backend = remote_at(base, 1);
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        extract(input.to_str().unwrap(), &ExtractionConfig::default(), &backend),
    )
    .await
    .expect("error body read must be bounded");
    let err = assert_err!(result);
    assert!(matches!(err, Doc2TextError::BackendTimeout { .. }), "got {err:?}");
}

#[tokio::test]
async fn oversized_error_body_is_cut_short() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("x".repeat(100_000)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let result = extract(
        receipt(&dir).to_str().unwrap(),
        &ExtractionConfig::default(),
        &remote(&server),
    )
    .await;
    match assert_err!(result) {
        Doc2TextError::BackendRejected { status, detail } => {
            assert_eq!(status, Some(400));
            assert!(detail.len() < 4096, "detail kept {} bytes", detail.len());
        }
        other => panic!("expected BackendRejected, got {other:?}"),
    }
}

#[tokio::test]
async fn stalled_stream_body_is_a_timeout() {
    init_tracing();
    let base = scripted_server(vec![
        Step::Send(SSE_HEAD.to_string()),
        Step::Send(http_chunk(&chunk("Tot"))),
        Step::Stall,
    ])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let input = receipt(&dir);
    let backend = remote_at(base, 1);
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        extract(input.to_str().unwrap(), &ExtractionConfig::default(), &backend),
    )
    .await
    .expect("idle stream must time out");
    let err = assert_err!(result);
    assert!(matches!(err, Doc2TextError::BackendTimeout { .. }), "got {err:?}");
}

#[tokio::test]
async fn connection_reset_mid_stream_is_interrupted_with_prefix() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let result = extract(
        receipt(&dir).to_str().unwrap(),
        &ExtractionConfig::default(),
        &remote_at(breaking_server().await, 5),
    )
    .await;

    match assert_err!(result) {
        Doc2TextError::StreamInterrupted { partial, .. } => assert_eq!(partial, "Total: $12"),
        other => panic!("expected StreamInterrupted, got {other:?}"),
    }
}

#[tokio::test]
async fn best_effort_keeps_partial_text_from_a_reset_stream() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = assert_ok!(ExtractionConfig::builder()
        .partial_policy(PartialPolicy::BestEffort)
        .build());

    let output = assert_ok!(
        extract(
            receipt(&dir).to_str().unwrap(),
            &config,
            &remote_at(breaking_server().await, 5),
        )
        .await
    );

    assert_eq!(output.text, "Total: $12");
    assert!(output.interrupted);
    assert!(output.truncated);
    assert!(!output.finished);
    assert!(!output.cancelled);
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_before_response_returns_quickly() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            sse_response(sse_body(&["late"], "stop")).set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let input = receipt(&dir);
    let backend = remote(&server);
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let output = tokio::time::timeout(
        Duration::from_secs(10),
        extract_with_cancel(
            input.to_str().unwrap(),
            &ExtractionConfig::default(),
            &backend,
            &cancel,
        ),
    )
    .await
    .expect("cancellation must not wait for the server")
    .unwrap();

    assert!(output.cancelled);
    assert!(output.truncated);
    assert_eq!(output.text, "");
}

struct CancelOnFirstDelta {
    cancel: CancelToken,
}

impl ExtractionProgressCallback for CancelOnFirstDelta {
    fn on_delta(&self, _delta: &str) {
        self.cancel.cancel();
    }
}

#[tokio::test]
async fn cancel_mid_stream_over_a_live_connection() {
    init_tracing();
    let base = scripted_server(vec![
        Step::Send(SSE_HEAD.to_string()),
        Step::Send(http_chunk(&chunk("Tot"))),
        Step::Stall,
    ])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let input = receipt(&dir);
    let backend = remote_at(base, 30);
    let cancel = CancelToken::new();
    let config = ExtractionConfig::builder()
        .progress_callback(Arc::new(CancelOnFirstDelta {
            cancel: cancel.clone(),
        }))
        .build()
        .unwrap();

    let output = tokio::time::timeout(
        Duration::from_secs(10),
        extract_with_cancel(input.to_str().unwrap(), &config, &backend, &cancel),
    )
    .await
    .expect("cancellation must not wait for the stalled server")
    .unwrap();

    assert_eq!(output.text, "Tot");
    assert!(output.cancelled);
    assert!(output.truncated);
}

#[tokio::test]
async fn cancel_mid_stream_keeps_prefix_and_closes_once() {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<StreamEvent, StreamFault>>(8);
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    let stream = DeltaStream::new(tokio_stream::wrappers::ReceiverStream::new(rx))
        .with_close_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let cancel = CancelToken::new();
    let seen = Arc::new(Mutex::new(String::new()));
    let trigger = cancel.clone();
    let sink = Arc::clone(&seen);
    let on_delta: &(dyn Fn(&str) + Send + Sync) = &move |d: &str| {
        sink.lock().unwrap().push_str(d);
        if d == "Tot" {
            trigger.cancel();
        }
    };

    tx.send(Ok(StreamEvent::Delta("Tot".into()))).await.unwrap();
    let collected = collect_stream(stream, &cancel, Some(on_delta))
        .await
        .unwrap();

    assert_eq!(collected.full_text, "Tot");
    assert!(collected.cancelled);
    assert!(collected.truncated);
    assert!(!collected.finished);
    assert_eq!(*seen.lock().unwrap(), "Tot");
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    // The producer side sees the receiver gone.
    assert!(tx.send(Ok(StreamEvent::Delta("al".into()))).await.is_err());
}

#[tokio::test]
async fn broken_connection_reports_partial_text() {
    let events = vec![
        Ok(StreamEvent::Delta("Total: ".into())),
        Ok(StreamEvent::Delta("$12".into())),
        Err(StreamFault::Transport("connection reset by peer".into())),
    ];
    let stream = DeltaStream::new(futures::stream::iter(events));

    let err = collect_stream(stream, &CancelToken::new(), None)
        .await
        .unwrap_err();

    match err {
        Doc2TextError::StreamInterrupted { partial, detail } => {
            assert_eq!(partial, "Total: $12");
            assert!(detail.contains("reset"));
        }
        other => panic!("expected StreamInterrupted, got {other:?}"),
    }
}
