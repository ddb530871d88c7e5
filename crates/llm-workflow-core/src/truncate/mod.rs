// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structure-aware code truncation.
//!
//! [`truncate_code`] shortens source text while keeping whole top-level
//! blocks intact. It is pure and deterministic: no I/O, no logging, safe
//! for concurrent use, and any internal panic is recovered into an error.
//! Error messages never include source content.
//!
//! The pipeline: strip strings and comments preserving byte positions,
//! find the end of the import section, detect top-level blocks (brace
//! counting for Go/TypeScript/JavaScript, indentation for Python), then
//! assemble whole blocks under the configured limits and append an
//! indicator comment describing what was omitted. Unknown languages fall
//! back to line-based truncation.

mod blocks;
mod strip;

pub use blocks::{Block, BlockKind};

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Default input size cap: 10 MiB.
pub const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Truncation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TruncateError {
    /// The input exceeds the configured byte cap.
    #[error("input exceeds the configured size limit")]
    InputTooLarge,
    /// An option value is out of range.
    #[error("invalid truncation options: {0}")]
    InvalidOptions(String),
    /// Brace nesting exceeded the safety cap.
    #[error("maximum nesting depth exceeded")]
    MaxNestingDepthExceeded,
    /// Recovered internal failure.
    #[error("internal truncation error: {0}")]
    Internal(String),
}

/// Supported source languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Go,
    TypeScript,
    Python,
    JavaScript,
    /// Anything else; handled with line-based truncation.
    Unknown,
}

impl Language {
    /// Parses a language name, case-insensitive and trimmed.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "go" => Self::Go,
            "typescript" | "ts" => Self::TypeScript,
            "python" | "py" => Self::Python,
            "javascript" | "js" => Self::JavaScript,
            _ => Self::Unknown,
        }
    }

    fn uses_slash_comments(&self) -> bool {
        matches!(self, Self::Go | Self::TypeScript | Self::JavaScript)
    }

    fn comment_prefix(&self) -> &'static str {
        match self {
            Self::Python => "#",
            _ => "//",
        }
    }
}

/// Truncation options. Zero means "no limit" for lines and tokens and
/// "use the default" for bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncateOptions {
    /// Maximum output lines (0 = unlimited).
    #[serde(default)]
    pub max_lines: usize,
    /// Maximum estimated output tokens (0 = unlimited).
    #[serde(default)]
    pub max_tokens: usize,
    /// Maximum input bytes (0 = 10 MiB default).
    #[serde(default)]
    pub max_bytes: usize,
    /// Source language name; unknown values fall back to line-based mode.
    #[serde(default)]
    pub language: String,
    /// Always include the import/header section.
    #[serde(default)]
    pub preserve_top: bool,
    /// Keep whole top-level blocks instead of cutting lines.
    #[serde(default)]
    pub preserve_func: bool,
}

impl Default for TruncateOptions {
    fn default() -> Self {
        Self {
            max_lines: 0,
            max_tokens: 0,
            max_bytes: DEFAULT_MAX_BYTES,
            language: String::new(),
            preserve_top: false,
            preserve_func: false,
        }
    }
}

/// An omitted block reported in the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmittedItem {
    /// Block kind label.
    #[serde(rename = "type")]
    pub kind: String,
    /// Block name.
    pub name: String,
    /// First line, 0-indexed.
    pub start_line: usize,
    /// Last line, 0-indexed, inclusive.
    pub end_line: usize,
}

/// Truncation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncateResult {
    /// Possibly shortened content.
    pub content: String,
    /// Whether any shortening happened.
    pub was_truncated: bool,
    /// Line count of the input.
    pub original_lines: usize,
    /// Line count of the output.
    pub final_lines: usize,
    /// `ceil(len(content) / 4)` of the output.
    pub estimated_tokens: usize,
    /// Blocks that were dropped.
    pub omitted_items: Vec<OmittedItem>,
    /// The indicator comment appended to the output (empty when nothing
    /// was omitted).
    pub indicator: String,
}

/// Estimates tokens as `ceil(len / 4)`. This is the engine's sole token
/// heuristic.
pub fn estimate_tokens(content: &str) -> usize {
    content.len().div_ceil(4)
}

/// Detects top-level blocks in source text.
pub fn detect_blocks(content: &str, language: &str) -> Result<Vec<Block>, TruncateError> {
    let language = Language::parse(language);
    let stripped = strip::strip(content, language)?;
    Ok(blocks::detect_blocks(&stripped, language))
}

/// Shortens source code while preserving structural integrity.
pub fn truncate_code(
    content: &str,
    options: &TruncateOptions,
) -> Result<TruncateResult, TruncateError> {
    let max_bytes = if options.max_bytes == 0 {
        DEFAULT_MAX_BYTES
    } else {
        options.max_bytes
    };
    if content.len() > max_bytes {
        return Err(TruncateError::InputTooLarge);
    }

    catch_unwind(AssertUnwindSafe(|| truncate_inner(content, options)))
        .map_err(|_| TruncateError::Internal("recovered panic during truncation".to_string()))?
}

fn truncate_inner(
    content: &str,
    options: &TruncateOptions,
) -> Result<TruncateResult, TruncateError> {
    let original_lines = content.lines().count();
    let no_limits = options.max_lines == 0 && options.max_tokens == 0;
    let fits = (options.max_lines == 0 || original_lines <= options.max_lines)
        && (options.max_tokens == 0 || estimate_tokens(content) <= options.max_tokens);

    if no_limits || fits {
        return Ok(TruncateResult {
            content: content.to_string(),
            was_truncated: false,
            original_lines,
            final_lines: original_lines,
            estimated_tokens: estimate_tokens(content),
            omitted_items: Vec::new(),
            indicator: String::new(),
        });
    }

    let language = Language::parse(&options.language);
    let structured =
        (options.preserve_top || options.preserve_func) && language != Language::Unknown;

    if !structured {
        return Ok(truncate_lines(content, options, language, original_lines));
    }

    let stripped = strip::strip(content, language)?;
    let stripped_lines: Vec<&str> = stripped.lines().collect();
    let import_end = if options.preserve_top {
        blocks::detect_import_end(&stripped_lines, language)
    } else {
        0
    };
    let detected = blocks::detect_blocks(&stripped, language);

    Ok(assemble_blocks(
        content,
        options,
        language,
        original_lines,
        import_end,
        detected,
    ))
}

/// Line-based truncation: cut at the smaller of the line limit and the
/// line whose cumulative character count crosses the token budget.
fn truncate_lines(
    content: &str,
    options: &TruncateOptions,
    language: Language,
    original_lines: usize,
) -> TruncateResult {
    let lines: Vec<&str> = content.lines().collect();

    let mut cut = if options.max_lines > 0 {
        options.max_lines.min(lines.len())
    } else {
        lines.len()
    };

    if options.max_tokens > 0 {
        let char_budget = options.max_tokens.saturating_mul(4);
        let mut used = 0usize;
        let mut token_cut = lines.len();
        for (i, line) in lines.iter().enumerate() {
            used += line.len() + 1;
            if used > char_budget {
                token_cut = i;
                break;
            }
        }
        cut = cut.min(token_cut);
    }

    let omitted = original_lines - cut;
    let indicator = format!(
        "{} ... truncated ({} lines omitted)",
        language.comment_prefix(),
        omitted
    );

    let mut out = lines[..cut].join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(&indicator);

    let final_lines = out.lines().count();
    TruncateResult {
        estimated_tokens: estimate_tokens(&out),
        content: out,
        was_truncated: true,
        original_lines,
        final_lines,
        omitted_items: Vec::new(),
        indicator,
    }
}

/// Structured truncation: whole blocks in file order under the limits.
fn assemble_blocks(
    content: &str,
    options: &TruncateOptions,
    language: Language,
    original_lines: usize,
    import_end: usize,
    detected: Vec<Block>,
) -> TruncateResult {
    let lines: Vec<&str> = content.lines().collect();
    let char_budget = if options.max_tokens > 0 {
        options.max_tokens.saturating_mul(4)
    } else {
        usize::MAX
    };
    let line_budget = if options.max_lines > 0 {
        options.max_lines
    } else {
        usize::MAX
    };

    let range_chars =
        |start: usize, end: usize| lines[start..=end].iter().map(|l| l.len() + 1).sum::<usize>();

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut lines_used = 0usize;
    let mut chars_used = 0usize;

    // The import section is always included when requested, even if it
    // exceeds the limits on its own.
    if import_end > 0 {
        let end = import_end - 1;
        ranges.push((0, end));
        lines_used += end + 1;
        chars_used += range_chars(0, end);
    }

    let mut omitted_blocks: Vec<Block> = Vec::new();
    let mut stopped = false;

    for block in detected {
        // Skip blocks already covered by the import range.
        if import_end > 0 && block.end_line < import_end {
            continue;
        }
        if stopped {
            omitted_blocks.push(block);
            continue;
        }

        let n_lines = block.line_count();
        let n_chars = range_chars(block.start_line, block.end_line);
        if lines_used + n_lines > line_budget || chars_used + n_chars > char_budget {
            // Whole blocks only: stop before the first block that would
            // exceed any limit.
            stopped = true;
            omitted_blocks.push(block);
            continue;
        }

        lines_used += n_lines;
        chars_used += n_chars;
        match ranges.last_mut() {
            Some(last) if block.start_line <= last.1 + 1 => last.1 = block.end_line.max(last.1),
            _ => ranges.push((block.start_line, block.end_line)),
        }
    }

    let included_lines: usize = ranges.iter().map(|(s, e)| e - s + 1).sum();
    let omitted_line_count = original_lines.saturating_sub(included_lines);

    let indicator = if omitted_line_count > 0 || !omitted_blocks.is_empty() {
        format!(
            "{} ... truncated: omitted {} ({} lines)",
            language.comment_prefix(),
            describe_omitted(&omitted_blocks),
            omitted_line_count
        )
    } else {
        String::new()
    };

    let mut pieces: Vec<String> = ranges
        .iter()
        .map(|&(s, e)| lines[s..=e].join("\n"))
        .collect();
    if !indicator.is_empty() {
        pieces.push(indicator.clone());
    }
    let out = pieces.join("\n");

    let was_truncated = out != content;
    let final_lines = out.lines().count();
    let omitted_items = omitted_blocks
        .into_iter()
        .map(|b| OmittedItem {
            kind: b.kind.label().to_string(),
            name: b.name,
            start_line: b.start_line,
            end_line: b.end_line,
        })
        .collect();

    TruncateResult {
        estimated_tokens: estimate_tokens(&out),
        content: out,
        was_truncated,
        original_lines,
        final_lines,
        omitted_items,
        indicator,
    }
}

/// "2 functions, 1 class" style description, in a stable kind order.
fn describe_omitted(omitted: &[Block]) -> String {
    const ORDER: [BlockKind; 5] = [
        BlockKind::Function,
        BlockKind::Method,
        BlockKind::Class,
        BlockKind::Type,
        BlockKind::Interface,
    ];

    let mut parts = Vec::new();
    for kind in ORDER {
        let count = omitted.iter().filter(|b| b.kind == kind).count();
        if count == 1 {
            parts.push(format!("1 {}", kind.label()));
        } else if count > 1 {
            parts.push(format!("{} {}", count, kind.label_plural()));
        }
    }
    if parts.is_empty() {
        "0 blocks".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PY_SERVICE: &str = r#""""HTTP handler service."""

import asyncio
import logging
from dataclasses import dataclass
from typing import Optional


@dataclass
class Config:
    host: str = "0.0.0.0"
    port: int = 8080
    debug: bool = False

class Handler:
    def __init__(self, config):
        self.config = config

    async def handle_request(self, request):
        if self.config.debug:
            logging.debug("request: %s", request)
        return {"status": "ok"}

    def shutdown(self):
        logging.info("shutting down")
        self.config = None

def create_handler(config):
    handler = Handler(config)
    return handler

@app.route("/health")
async def health_check():
    return "ok"
"#;

    #[test]
    fn test_python_block_detection_positions() {
        let blocks = detect_blocks(PY_SERVICE, "python").unwrap();
        let summary: Vec<(&str, &str, usize, usize)> = blocks
            .iter()
            .map(|b| (b.kind.label(), b.name.as_str(), b.start_line, b.end_line))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("class", "Config", 8, 12),
                ("class", "Handler", 14, 25),
                ("function", "create_handler", 27, 29),
                ("function", "health_check", 31, 33),
            ]
        );
    }

    #[test]
    fn test_unchanged_when_no_limits() {
        let result = truncate_code(PY_SERVICE, &TruncateOptions::default()).unwrap();
        assert!(!result.was_truncated);
        assert_eq!(result.content, PY_SERVICE);
        assert_eq!(result.final_lines, result.original_lines);
        assert!(result.indicator.is_empty());
    }

    #[test]
    fn test_unchanged_when_fits() {
        let options = TruncateOptions {
            max_lines: 1000,
            ..Default::default()
        };
        let result = truncate_code(PY_SERVICE, &options).unwrap();
        assert!(!result.was_truncated);
    }

    #[test]
    fn test_line_based_cut() {
        let options = TruncateOptions {
            max_lines: 5,
            ..Default::default()
        };
        let result = truncate_code(PY_SERVICE, &options).unwrap();
        assert!(result.was_truncated);
        assert_eq!(result.final_lines, 6); // 5 lines + indicator
        assert!(result.content.ends_with(&result.indicator));
        assert!(result.indicator.contains("lines omitted"));
    }

    #[test]
    fn test_token_based_cut() {
        let options = TruncateOptions {
            max_tokens: 10, // 40 characters
            ..Default::default()
        };
        let result = truncate_code(PY_SERVICE, &options).unwrap();
        assert!(result.was_truncated);
        assert!(result.final_lines < result.original_lines);
    }

    #[test]
    fn test_preserve_func_keeps_whole_blocks() {
        let options = TruncateOptions {
            max_lines: 22,
            language: "python".to_string(),
            preserve_top: true,
            preserve_func: true,
            ..Default::default()
        };
        let result = truncate_code(PY_SERVICE, &options).unwrap();
        assert!(result.was_truncated);

        // Imports survive.
        assert!(result.content.contains("import asyncio"));
        // Whatever block starts in the output also ends in it: Config fits.
        assert!(result.content.contains("class Config:"));
        assert!(result.content.contains("debug: bool = False"));
        // Handler (12 lines) would blow the budget, so it and everything
        // after is omitted.
        assert!(!result.content.contains("class Handler"));
        assert!(!result.omitted_items.is_empty());
        assert_eq!(result.omitted_items[0].name, "Handler");
        assert!(result.indicator.starts_with("# ... truncated"));
        assert!(result.indicator.contains("class"));
    }

    #[test]
    fn test_preserve_top_includes_imports_even_when_over_budget() {
        let options = TruncateOptions {
            max_lines: 2,
            language: "python".to_string(),
            preserve_top: true,
            preserve_func: true,
            ..Default::default()
        };
        let result = truncate_code(PY_SERVICE, &options).unwrap();
        assert!(result.content.contains("from typing import Optional"));
        // No block fits in two lines.
        assert_eq!(result.omitted_items.len(), 4);
    }

    #[test]
    fn test_unknown_language_falls_back_to_lines() {
        let options = TruncateOptions {
            max_lines: 3,
            language: "cobol".to_string(),
            preserve_top: true,
            preserve_func: true,
            ..Default::default()
        };
        let result = truncate_code(PY_SERVICE, &options).unwrap();
        assert_eq!(result.final_lines, 4);
        assert!(result.omitted_items.is_empty());
    }

    #[test]
    fn test_input_too_large() {
        let options = TruncateOptions {
            max_bytes: 8,
            ..Default::default()
        };
        let err = truncate_code("0123456789", &options).unwrap_err();
        assert_eq!(err, TruncateError::InputTooLarge);
        // The message never leaks source content.
        assert!(!err.to_string().contains("0123456789"));
    }

    #[test]
    fn test_deterministic() {
        let options = TruncateOptions {
            max_lines: 20,
            language: "python".to_string(),
            preserve_top: true,
            preserve_func: true,
            ..Default::default()
        };
        let a = truncate_code(PY_SERVICE, &options).unwrap();
        let b = truncate_code(PY_SERVICE, &options).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_length_non_growth() {
        for max_lines in [1, 5, 10, 20, 30] {
            let options = TruncateOptions {
                max_lines,
                language: "python".to_string(),
                preserve_top: true,
                preserve_func: true,
                ..Default::default()
            };
            let result = truncate_code(PY_SERVICE, &options).unwrap();
            assert!(
                result.content.len() <= PY_SERVICE.len() + result.indicator.len() + 1,
                "grew at max_lines={}",
                max_lines
            );
            assert!(result.final_lines <= result.original_lines.max(max_lines + 1));
        }
    }

    #[test]
    fn test_estimate_tokens_heuristic() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_language_parse_case_insensitive() {
        assert_eq!(Language::parse("  Go "), Language::Go);
        assert_eq!(Language::parse("TypeScript"), Language::TypeScript);
        assert_eq!(Language::parse("PYTHON"), Language::Python);
        assert_eq!(Language::parse("rust"), Language::Unknown);
    }
}
