//! Post-processing: optional, deterministic cleanup of model output.
//!
//! Vision models asked for YAML or JSON often wrap the answer in a
//! ```` ```yaml ... ``` ```` fence, emit `\r\n` line endings, or leave trailing
//! spaces. None of that is content. [`clean_output`] removes it; the sink
//! otherwise persists the model text byte-for-byte, so this is opt-in via
//! [`crate::config::ExtractionConfig::clean_output`].
//!
//! The fence is stripped first; its pattern accepts `\r\n` on its own, so
//! line-ending normalisation can come after it.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules:
///
/// 1. Strip one outer code fence with an optional language tag
/// 2. Normalise line endings (CRLF → LF)
/// 3. Trim trailing whitespace per line
/// 4. Collapse 3+ consecutive blank lines down to 2
/// 5. Ensure the text ends with exactly one newline
pub fn clean_output(input: &str) -> String {
    let s = strip_outer_fence(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    ensure_final_newline(&s)
}

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_+-]*\r?\n(.*?)\r?\n```\s*$").unwrap());

fn strip_outer_fence(input: &str) -> String {
    match RE_OUTER_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_yaml_fence() {
        let raw = "```yaml\ntotal: 12.50\ncurrency: USD\n```";
        assert_eq!(clean_output(raw), "total: 12.50\ncurrency: USD\n");
    }

    #[test]
    fn strips_bare_fence_with_crlf() {
        let raw = "```\r\n{\"total\": 12.5}\r\n```\r\n";
        assert_eq!(clean_output(raw), "{\"total\": 12.5}\n");
    }

    #[test]
    fn inner_fences_are_kept() {
        let raw = "intro\n```json\n{}\n```\noutro";
        assert_eq!(clean_output(raw), "intro\n```json\n{}\n```\noutro\n");
    }

    #[test]
    fn trims_trailing_whitespace_and_blank_runs() {
        let raw = "a   \n\n\n\n\nb\t\n";
        assert_eq!(clean_output(raw), "a\n\n\nb\n");
    }

    #[test]
    fn empty_input_becomes_single_newline() {
        assert_eq!(clean_output("   \n"), "\n");
    }
}
