// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! String and comment stripping with position preservation.
//!
//! Every byte inside a comment or string literal (delimiters included) is
//! replaced with a space; newlines survive. Byte offsets and line numbers
//! in the stripped text therefore match the original, which is what block
//! detection relies on.

use super::{Language, TruncateError};

const MAX_NESTING_DEPTH: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Code,
    LineComment,
    BlockComment,
    /// Quoted string with the given delimiter and escape support.
    Str(u8),
    /// Raw string (backtick); no escapes.
    RawStr,
    /// Python triple-quoted string with the given quote byte.
    Triple(u8),
}

/// Strips comments and string literals from source text.
pub(crate) fn strip(content: &str, language: Language) -> Result<String, TruncateError> {
    if language == Language::Unknown {
        return Ok(content.to_string());
    }

    let bytes = content.as_bytes();
    let mut out = bytes.to_vec();
    let mut state = State::Code;
    let mut escaped = false;
    let mut depth = 0usize;
    let mut i = 0;

    let has_line_comment_slashes = language.uses_slash_comments();
    let has_block_comments = language.uses_slash_comments();
    let has_hash_comments = language == Language::Python;
    let has_triple_strings = language == Language::Python;
    let has_raw_strings = matches!(
        language,
        Language::Go | Language::TypeScript | Language::JavaScript
    );

    while i < bytes.len() {
        let b = bytes[i];

        match state {
            State::Code => match b {
                b'{' => {
                    depth += 1;
                    if depth > MAX_NESTING_DEPTH {
                        return Err(TruncateError::MaxNestingDepthExceeded);
                    }
                }
                b'}' => depth = depth.saturating_sub(1),
                b'/' if has_line_comment_slashes && bytes.get(i + 1) == Some(&b'/') => {
                    state = State::LineComment;
                    out[i] = b' ';
                    out[i + 1] = b' ';
                    i += 2;
                    continue;
                }
                b'/' if has_block_comments && bytes.get(i + 1) == Some(&b'*') => {
                    state = State::BlockComment;
                    out[i] = b' ';
                    out[i + 1] = b' ';
                    i += 2;
                    continue;
                }
                b'#' if has_hash_comments => {
                    state = State::LineComment;
                    out[i] = b' ';
                }
                b'"' | b'\'' => {
                    if has_triple_strings
                        && bytes.get(i + 1) == Some(&b)
                        && bytes.get(i + 2) == Some(&b)
                    {
                        state = State::Triple(b);
                        out[i] = b' ';
                        out[i + 1] = b' ';
                        out[i + 2] = b' ';
                        i += 3;
                        continue;
                    }
                    state = State::Str(b);
                    escaped = false;
                    out[i] = b' ';
                }
                b'`' if has_raw_strings => {
                    state = State::RawStr;
                    out[i] = b' ';
                }
                _ => {}
            },
            State::LineComment => {
                if b == b'\n' {
                    state = State::Code;
                } else {
                    out[i] = b' ';
                }
            }
            State::BlockComment => {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    out[i] = b' ';
                    out[i + 1] = b' ';
                    state = State::Code;
                    i += 2;
                    continue;
                }
                if b != b'\n' {
                    out[i] = b' ';
                }
            }
            State::Str(delim) => {
                if b != b'\n' {
                    out[i] = b' ';
                }
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == delim || b == b'\n' {
                    // An unterminated single-line string ends at the newline.
                    state = State::Code;
                }
            }
            State::RawStr => {
                if b != b'\n' {
                    out[i] = b' ';
                }
                if b == b'`' {
                    state = State::Code;
                }
            }
            State::Triple(quote) => {
                if b == quote && bytes.get(i + 1) == Some(&quote) && bytes.get(i + 2) == Some(&quote)
                {
                    out[i] = b' ';
                    out[i + 1] = b' ';
                    out[i + 2] = b' ';
                    state = State::Code;
                    i += 3;
                    continue;
                }
                if b != b'\n' {
                    out[i] = b' ';
                }
            }
        }

        i += 1;
    }

    // The replacements only ever write ASCII spaces over existing bytes, so
    // the buffer is valid UTF-8 whenever the input was.
    String::from_utf8(out).map_err(|_| TruncateError::Internal("stripper produced invalid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_go_line_comment() {
        let src = "x := 1 // trailing note\ny := 2\n";
        let out = strip(src, Language::Go).unwrap();
        assert_eq!(out.len(), src.len());
        assert!(out.contains("x := 1"));
        assert!(!out.contains("trailing"));
        assert_eq!(out.lines().count(), src.lines().count());
    }

    #[test]
    fn test_strip_block_comment_preserves_newlines() {
        let src = "a /* one\ntwo\nthree */ b\n";
        let out = strip(src, Language::Go).unwrap();
        assert_eq!(out.lines().count(), 3);
        assert!(!out.contains("two"));
        assert!(out.contains('a'));
        assert!(out.contains('b'));
    }

    #[test]
    fn test_strip_string_with_escapes() {
        let src = r#"s := "quote \" brace { inside""#;
        let out = strip(src, Language::Go).unwrap();
        assert!(!out.contains("brace"));
        // The brace inside the string must not count toward nesting.
        assert!(!out.contains('{'));
        assert!(out.starts_with("s :="));
    }

    #[test]
    fn test_strip_backtick_raw_string() {
        let src = "tmpl := `hello \"world\" // not a comment`\nnext := 1\n";
        let out = strip(src, Language::Go).unwrap();
        assert!(!out.contains("hello"));
        assert!(out.contains("next := 1"));
    }

    #[test]
    fn test_strip_python_triple_quoted() {
        let src = "\"\"\"Module docstring.\n\nSpans lines.\n\"\"\"\nimport os\n";
        let out = strip(src, Language::Python).unwrap();
        assert!(!out.contains("docstring"));
        assert!(!out.contains("Spans"));
        assert!(out.contains("import os"));
        assert_eq!(out.lines().count(), src.lines().count());
    }

    #[test]
    fn test_strip_python_hash_comment() {
        let src = "x = 1  # comment with 'quote'\ny = '#not a comment'\n";
        let out = strip(src, Language::Python).unwrap();
        assert!(!out.contains("comment with"));
        assert!(out.contains("y ="));
        assert!(!out.contains("not a comment"));
    }

    #[test]
    fn test_unterminated_string_ends_at_newline() {
        let src = "s = \"unterminated\nrest = 1\n";
        let out = strip(src, Language::Python).unwrap();
        assert!(out.contains("rest = 1"));
    }

    #[test]
    fn test_nesting_depth_enforced() {
        let src = "{".repeat(MAX_NESTING_DEPTH + 1);
        let err = strip(&src, Language::Go).unwrap_err();
        assert!(matches!(err, TruncateError::MaxNestingDepthExceeded));
    }

    #[test]
    fn test_unknown_language_passthrough() {
        let src = "anything // at all";
        assert_eq!(strip(src, Language::Unknown).unwrap(), src);
    }
}
