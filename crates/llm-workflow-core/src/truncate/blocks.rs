// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Import-section and top-level block detection on stripped source.
//!
//! Brace-counting locates block extents for Go, TypeScript and JavaScript;
//! indentation does for Python (decorators and `async def` included).
//! Line numbers are 0-indexed and inclusive.

use super::Language;

/// Kind of a detected top-level block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Function,
    Method,
    Class,
    Type,
    Interface,
}

impl BlockKind {
    /// Singular label used in omission indicators.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Class => "class",
            Self::Type => "type",
            Self::Interface => "interface",
        }
    }

    /// Plural label used in omission indicators.
    pub fn label_plural(&self) -> &'static str {
        match self {
            Self::Function => "functions",
            Self::Method => "methods",
            Self::Class => "classes",
            Self::Type => "types",
            Self::Interface => "interfaces",
        }
    }
}

/// A top-level block in the source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Block kind.
    pub kind: BlockKind,
    /// Declared name.
    pub name: String,
    /// First line, 0-indexed (includes leading decorators in Python).
    pub start_line: usize,
    /// Last line, 0-indexed, inclusive.
    pub end_line: usize,
}

impl Block {
    /// Number of source lines the block spans.
    pub fn line_count(&self) -> usize {
        self.end_line - self.start_line + 1
    }
}

/// Returns the first line index after the language's import/header section.
pub(crate) fn detect_import_end(lines: &[&str], language: Language) -> usize {
    match language {
        Language::Go => go_import_end(lines),
        Language::Python => python_import_end(lines),
        Language::TypeScript | Language::JavaScript => js_import_end(lines),
        Language::Unknown => 0,
    }
}

fn go_import_end(lines: &[&str]) -> usize {
    let mut end = 0;
    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim();
        if trimmed.is_empty() || trimmed.starts_with("//") {
            i += 1;
            continue;
        }
        if trimmed.starts_with("package ") {
            end = i + 1;
            i += 1;
            continue;
        }
        if trimmed.starts_with("import (") {
            // Grouped import: scan to the closing paren.
            while i < lines.len() && !lines[i].trim_start().starts_with(')') {
                i += 1;
            }
            end = (i + 1).min(lines.len());
            i += 1;
            continue;
        }
        if trimmed.starts_with("import ") {
            end = i + 1;
            i += 1;
            continue;
        }
        break;
    }
    end
}

fn python_import_end(lines: &[&str]) -> usize {
    let mut end = 0;
    let mut i = 0;
    // A leading module docstring is part of the header. The stripper has
    // already blanked its content, so it shows up as blank lines here and
    // the blank-skip below covers it.
    while i < lines.len() {
        let trimmed = lines[i].trim();
        if trimmed.is_empty() {
            i += 1;
            continue;
        }
        if trimmed.starts_with("import ") || trimmed.starts_with("from ") {
            // Parenthesized import lists may span lines.
            if trimmed.contains('(') && !trimmed.contains(')') {
                while i < lines.len() && !lines[i].contains(')') {
                    i += 1;
                }
            }
            end = (i + 1).min(lines.len());
            i += 1;
            continue;
        }
        break;
    }
    end
}

fn js_import_end(lines: &[&str]) -> usize {
    let mut end = 0;
    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim();
        if trimmed.is_empty() {
            i += 1;
            continue;
        }
        let is_import = trimmed.starts_with("import ")
            || trimmed.starts_with("import{")
            || (trimmed.starts_with("export ") && trimmed.contains(" from "))
            || (trimmed.starts_with("const ") && trimmed.contains("require("));
        if is_import {
            // Multi-line import specifier lists end at the `from` clause.
            if trimmed.contains('{') && !trimmed.contains('}') {
                while i < lines.len() && !lines[i].contains('}') {
                    i += 1;
                }
            }
            end = (i + 1).min(lines.len());
            i += 1;
            continue;
        }
        break;
    }
    end
}

/// Detects top-level blocks in stripped source text.
pub(crate) fn detect_blocks(stripped: &str, language: Language) -> Vec<Block> {
    let lines: Vec<&str> = stripped.lines().collect();
    match language {
        Language::Go => brace_blocks(&lines, go_header),
        Language::TypeScript | Language::JavaScript => brace_blocks(&lines, js_header),
        Language::Python => python_blocks(&lines),
        Language::Unknown => Vec::new(),
    }
}

/// Parses a block header at depth 0, returning its kind and name.
type HeaderFn = fn(&str) -> Option<(BlockKind, String)>;

fn brace_blocks(lines: &[&str], header: HeaderFn) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut depth = 0i64;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        if depth == 0 {
            if let Some((kind, name)) = header(line.trim()) {
                let end = block_end(lines, i);
                blocks.push(Block {
                    kind,
                    name,
                    start_line: i,
                    end_line: end,
                });
                // Resume scanning after the block; depth is balanced there.
                i = end + 1;
                continue;
            }
        }
        depth += brace_delta(line);
        i += 1;
    }

    blocks
}

/// Finds the last line of a brace-delimited block starting at `start`.
fn block_end(lines: &[&str], start: usize) -> usize {
    let mut depth = 0i64;
    let mut opened = false;

    for (offset, line) in lines[start..].iter().enumerate() {
        for &b in line.as_bytes() {
            match b {
                b'{' => {
                    depth += 1;
                    opened = true;
                }
                b'}' => depth -= 1,
                _ => {}
            }
        }
        if opened && depth <= 0 {
            return start + offset;
        }
        // Header with no braces within two lines: a single-line declaration
        // such as a type alias.
        if !opened && offset >= 1 {
            return start;
        }
    }
    lines.len().saturating_sub(1)
}

fn brace_delta(line: &str) -> i64 {
    let mut delta = 0;
    for &b in line.as_bytes() {
        match b {
            b'{' => delta += 1,
            b'}' => delta -= 1,
            _ => {}
        }
    }
    delta
}

fn go_header(line: &str) -> Option<(BlockKind, String)> {
    if let Some(rest) = line.strip_prefix("func ") {
        let rest = rest.trim_start();
        if rest.starts_with('(') {
            // Method: skip the receiver.
            let close = rest.find(')')?;
            let name = take_identifier(rest[close + 1..].trim_start());
            if !name.is_empty() {
                return Some((BlockKind::Method, name));
            }
            return None;
        }
        let name = take_identifier(rest);
        if !name.is_empty() {
            return Some((BlockKind::Function, name));
        }
        return None;
    }
    if let Some(rest) = line.strip_prefix("type ") {
        let name = take_identifier(rest);
        if name.is_empty() {
            return None;
        }
        let kind = if rest[name.len()..].trim_start().starts_with("interface") {
            BlockKind::Interface
        } else {
            BlockKind::Type
        };
        return Some((kind, name));
    }
    None
}

fn js_header(line: &str) -> Option<(BlockKind, String)> {
    let mut rest = line;
    for prefix in ["export ", "default ", "declare ", "abstract "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped.trim_start();
        }
    }

    if let Some(body) = rest.strip_prefix("async function") {
        let name = take_identifier(body.trim_start());
        return (!name.is_empty()).then_some((BlockKind::Function, name));
    }
    if let Some(body) = rest.strip_prefix("function") {
        let name = take_identifier(body.trim_start().trim_start_matches('*').trim_start());
        return (!name.is_empty()).then_some((BlockKind::Function, name));
    }
    if let Some(body) = rest.strip_prefix("class ") {
        let name = take_identifier(body.trim_start());
        return (!name.is_empty()).then_some((BlockKind::Class, name));
    }
    if let Some(body) = rest.strip_prefix("interface ") {
        let name = take_identifier(body.trim_start());
        return (!name.is_empty()).then_some((BlockKind::Interface, name));
    }
    if let Some(body) = rest.strip_prefix("enum ") {
        let name = take_identifier(body.trim_start());
        return (!name.is_empty()).then_some((BlockKind::Type, name));
    }
    if let Some(body) = rest.strip_prefix("type ") {
        let name = take_identifier(body.trim_start());
        if !name.is_empty() && body.contains('=') {
            return Some((BlockKind::Type, name));
        }
    }
    None
}

fn python_blocks(lines: &[&str]) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut pending_decorator: Option<usize> = None;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let is_top_level = !line.starts_with(' ') && !line.starts_with('\t');
        let trimmed = line.trim_end();

        if !is_top_level || trimmed.trim().is_empty() {
            i += 1;
            continue;
        }

        if trimmed.starts_with('@') {
            pending_decorator.get_or_insert(i);
            i += 1;
            continue;
        }

        let header = python_header(trimmed);
        match header {
            Some((kind, name)) => {
                let start = pending_decorator.take().unwrap_or(i);
                let end = python_block_end(lines, i);
                blocks.push(Block {
                    kind,
                    name,
                    start_line: start,
                    end_line: end,
                });
                i = end + 1;
            }
            None => {
                pending_decorator = None;
                i += 1;
            }
        }
    }

    blocks
}

fn python_header(line: &str) -> Option<(BlockKind, String)> {
    if let Some(rest) = line.strip_prefix("async def ") {
        let name = take_identifier(rest);
        return (!name.is_empty()).then_some((BlockKind::Function, name));
    }
    if let Some(rest) = line.strip_prefix("def ") {
        let name = take_identifier(rest);
        return (!name.is_empty()).then_some((BlockKind::Function, name));
    }
    if let Some(rest) = line.strip_prefix("class ") {
        let name = take_identifier(rest);
        return (!name.is_empty()).then_some((BlockKind::Class, name));
    }
    None
}

/// The last non-blank line belonging to the suite that starts at `header`.
fn python_block_end(lines: &[&str], header: usize) -> usize {
    let mut end = header;
    for (offset, line) in lines[header + 1..].iter().enumerate() {
        let idx = header + 1 + offset;
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(' ') && !line.starts_with('\t') {
            break;
        }
        end = idx;
    }
    end
}

fn take_identifier(s: &str) -> String {
    s.chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
        .collect()
}
