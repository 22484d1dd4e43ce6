//! CLI binary for edgequake-doc2text.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ExtractionConfig` + `RemoteSettings`, streams the answer, and handles
//! Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_doc2text::{
    extract_with_cancel, persist, Backend, CancelToken, ExtractionConfig,
    ExtractionProgressCallback, InstructionSource, PartialPolicy, ProgressCallback,
    RemoteSettings, SamplingConfig,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner on stderr while the document is prepared and the model runs.
///
/// When `echo` is set, deltas go to stdout as they arrive and the spinner
/// is cleared on the first one so the two never interleave.
struct CliProgressCallback {
    bar: Option<ProgressBar>,
    echo: bool,
    chars: AtomicUsize,
    first_delta: AtomicBool,
}

impl CliProgressCallback {
    fn new(show_spinner: bool, echo: bool) -> Arc<Self> {
        let bar = show_spinner.then(|| {
            let bar = ProgressBar::new_spinner();
            let style =
                ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
            bar.set_style(style);
            bar.set_prefix("Preparing");
            bar.set_message("Opening document…");
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        });

        Arc::new(Self {
            bar,
            echo,
            chars: AtomicUsize::new(0),
            first_delta: AtomicBool::new(true),
        })
    }

    fn clear(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_document_rasterized(&self, total_pages: usize, used_pages: usize, dropped: usize) {
        if let Some(bar) = &self.bar {
            let line = if dropped > 0 {
                format!(
                    "{} {} of {} pages  {}",
                    cyan("◆"),
                    bold(&used_pages.to_string()),
                    total_pages,
                    yellow(&format!("({dropped} dropped by --max-pages)"))
                )
            } else {
                format!("{} {} page(s)", cyan("◆"), bold(&used_pages.to_string()))
            };
            bar.println(line);
        }
    }

    fn on_generation_start(&self, image_count: usize) {
        if let Some(bar) = &self.bar {
            bar.set_prefix("Generating");
            bar.set_message(format!("{image_count} image(s) sent, waiting for first token…"));
        }
    }

    fn on_delta(&self, delta: &str) {
        let total = self.chars.fetch_add(delta.chars().count(), Ordering::Relaxed)
            + delta.chars().count();

        if self.echo {
            if self.first_delta.swap(false, Ordering::SeqCst) {
                self.clear();
            }
            let mut out = io::stdout().lock();
            // Stdout closed by the reader (e.g. `| head`); nothing useful to do.
            let _ = out.write_all(delta.as_bytes()).and_then(|_| out.flush());
        } else if let Some(bar) = &self.bar {
            bar.set_message(format!("{total} chars"));
        }
    }

    fn on_generation_complete(&self, text_len: usize, truncated: bool) {
        self.clear();
        if self.bar.is_some() {
            if truncated {
                eprintln!("{} {} chars (truncated)", yellow("⚠"), bold(&text_len.to_string()));
            } else {
                eprintln!("{} {} chars", green("✔"), bold(&text_len.to_string()));
            }
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Receipt to YAML against a local vLLM server (streams to stdout)
  doc2text receipt.jpg --instruction prompts/receipt.txt

  # First four pages of a statement, written atomically to a file
  doc2text statement.pdf --max-pages 4 -o statement.yaml

  # Downscale large scans before sending them
  doc2text --resize --max-dimension 1024 scan.pdf

  # Structured output with page sizes and timings
  doc2text --json invoice.pdf > invoice.json

  # Document from a URL, hosted endpoint with a key
  doc2text https://example.com/bill.pdf --url https://api.example.com --api-key sk-...

ENVIRONMENT VARIABLES:
  DOC2TEXT_URL            Server base URL (default http://localhost:8000)
  DOC2TEXT_MODEL          Served model name
  VLLM_API_KEY            Bearer token for the server
  DOC2TEXT_INSTRUCTION    Instruction file
  PDFIUM_LIB_PATH         Directory containing libpdfium
  RUST_LOG                Overrides the log filter

Ctrl-C cancels generation; the text received so far is still printed or written.
"#;

/// Extract structured text from images and PDFs using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "doc2text",
    version,
    about = "Extract structured text from images and PDFs using Vision LLMs",
    long_about = "Rasterise a document (image or PDF), send the pages together with an \
instruction to an OpenAI-compatible Vision Language Model server (vLLM, Ollama, LiteLLM, ...), \
and stream back the answer.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local image/PDF path or HTTP/HTTPS URL.
    input: String,

    /// Write the answer to this file instead of stdout.
    #[arg(short, long, env = "DOC2TEXT_OUTPUT")]
    output: Option<PathBuf>,

    /// Base URL of the OpenAI-compatible server.
    #[arg(long, env = "DOC2TEXT_URL", default_value = "http://localhost:8000")]
    url: String,

    /// Served model name.
    #[arg(long, env = "DOC2TEXT_MODEL", default_value = "Qwen/Qwen2.5-VL-7B-Instruct")]
    model: String,

    /// Bearer token for the server.
    #[arg(long, env = "VLLM_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Instruction file; the built-in instruction is used if the file does not exist.
    #[arg(long, env = "DOC2TEXT_INSTRUCTION")]
    instruction: Option<PathBuf>,

    /// File containing a system prompt.
    #[arg(long, env = "DOC2TEXT_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Use at most this many PDF pages; the rest are dropped.
    #[arg(long, env = "DOC2TEXT_MAX_PAGES", default_value_t = 6)]
    max_pages: usize,

    /// Downscale pages so neither side exceeds --max-dimension.
    #[arg(long, env = "DOC2TEXT_RESIZE")]
    resize: bool,

    /// Longest side in pixels when --resize is set.
    #[arg(long, env = "DOC2TEXT_MAX_DIMENSION", default_value_t = 1024)]
    max_dimension: u32,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "DOC2TEXT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Maximum images the server accepts per prompt.
    #[arg(long, env = "DOC2TEXT_IMAGE_LIMIT", default_value_t = 6)]
    image_limit: usize,

    /// Prompt + generation token budget of the served model (0 = unknown).
    #[arg(long, env = "DOC2TEXT_CONTEXT_WINDOW", default_value_t = 26096)]
    context_window: usize,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "DOC2TEXT_TEMPERATURE", default_value_t = 0.7)]
    temperature: f32,

    /// Nucleus sampling (0.0–1.0].
    #[arg(long, env = "DOC2TEXT_TOP_P", default_value_t = 0.8)]
    top_p: f32,

    /// Repetition penalty (vLLM extension).
    #[arg(long, env = "DOC2TEXT_REPETITION_PENALTY", default_value_t = 1.05)]
    repetition_penalty: f32,

    /// Frequency penalty (0.0–2.0).
    #[arg(long, env = "DOC2TEXT_FREQUENCY_PENALTY", default_value_t = 0.0)]
    frequency_penalty: f32,

    /// Presence penalty (0.0–2.0).
    #[arg(long, env = "DOC2TEXT_PRESENCE_PENALTY", default_value_t = 0.0)]
    presence_penalty: f32,

    /// Maximum generated tokens.
    #[arg(long, env = "DOC2TEXT_MAX_TOKENS", default_value_t = 8000)]
    max_tokens: usize,

    /// Seconds to wait for the response to start, and between chunks.
    #[arg(long, env = "DOC2TEXT_TIMEOUT", default_value_t = 600)]
    timeout: u64,

    /// Keep partial text when the connection breaks mid-answer.
    #[arg(long, env = "DOC2TEXT_BEST_EFFORT")]
    best_effort: bool,

    /// Strip an outer code fence and normalise whitespace.
    #[arg(long, env = "DOC2TEXT_CLEAN")]
    clean: bool,

    /// Also write the rasterised pages to this directory.
    #[arg(long, env = "DOC2TEXT_SAVE_PAGES")]
    save_pages: Option<PathBuf>,

    /// Output structured JSON (ExtractionOutput) instead of plain text.
    #[arg(long, env = "DOC2TEXT_JSON")]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOC2TEXT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and the answer.
    #[arg(short, long, env = "DOC2TEXT_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // INFO-level library logs would fight with the spinner.
    let show_progress = !cli.quiet && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Backend ──────────────────────────────────────────────────────────
    let mut settings = RemoteSettings::new(cli.url.clone(), cli.model.clone());
    settings.api_key = cli.api_key.clone();
    settings.timeout_secs = cli.timeout;
    settings.image_limit = cli.image_limit;
    settings.context_window = (cli.context_window > 0).then_some(cli.context_window);
    let backend = Backend::remote(settings).context("Invalid backend settings")?;

    // ── Config ───────────────────────────────────────────────────────────
    // Cleaned output can differ from the raw deltas, so it is printed at the end.
    let echo = cli.output.is_none() && !cli.json && !cli.clean;
    let progress = CliProgressCallback::new(show_progress && !cli.verbose, echo);
    let config = build_config(&cli, progress.clone() as ProgressCallback).await?;

    // ── Ctrl-C ───────────────────────────────────────────────────────────
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let output = extract_with_cancel(&cli.input, &config, &backend, &cancel)
        .await
        .context("Extraction failed")?;

    if let Some(ref output_path) = cli.output {
        if cli.json {
            let json =
                serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
            persist(&json, output_path)
                .await
                .with_context(|| format!("Failed to write {}", output_path.display()))?;
        } else {
            persist(&output.text, output_path)
                .await
                .with_context(|| format!("Failed to write {}", output_path.display()))?;
        }
    } else if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else {
        let mut handle = io::stdout().lock();
        if !echo {
            handle
                .write_all(output.text.as_bytes())
                .context("Failed to write to stdout")?;
        }
        if !output.text.ends_with('\n') {
            handle.write_all(b"\n").ok();
        }
    }

    // ── Summary ──────────────────────────────────────────────────────────
    if !cli.quiet && !cli.json {
        if output.cancelled {
            eprintln!("{} cancelled; kept {} chars", yellow("⚠"), output.text.chars().count());
        }
        if output.interrupted {
            eprintln!("{} connection lost; output is partial", yellow("⚠"));
        }
        if output.instruction_source == InstructionSource::Default {
            eprintln!("{} using the built-in instruction", dim("ℹ"));
        }
        eprintln!(
            "   {} page(s)  ~{} prompt tokens  {}ms total{}",
            output.stats.used_pages,
            dim(&output.stats.estimated_prompt_tokens.to_string()),
            output.stats.total_ms,
            cli.output
                .as_ref()
                .map(|p| format!("  →  {}", bold(&p.display().to_string())))
                .unwrap_or_default(),
        );
    }

    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(cli: &Cli, progress: ProgressCallback) -> Result<ExtractionConfig> {
    let sampling = SamplingConfig::builder()
        .temperature(cli.temperature)
        .top_p(cli.top_p)
        .repetition_penalty(cli.repetition_penalty)
        .frequency_penalty(cli.frequency_penalty)
        .presence_penalty(cli.presence_penalty)
        .max_tokens(cli.max_tokens)
        .build()
        .context("Invalid sampling parameters")?;

    let mut builder = ExtractionConfig::builder()
        .max_pages(cli.max_pages)
        .sampling(sampling)
        .clean_output(cli.clean)
        .partial_policy(if cli.best_effort {
            PartialPolicy::BestEffort
        } else {
            PartialPolicy::AllOrNothing
        })
        .progress_callback(progress);

    if cli.resize {
        builder = builder.target_max_dimension(cli.max_dimension);
    }
    if let Some(ref path) = cli.instruction {
        builder = builder.instruction_path(path);
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(ref dir) = cli.save_pages {
        builder = builder.page_dir(dir);
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password);
    }

    builder.build().context("Invalid configuration")
}
