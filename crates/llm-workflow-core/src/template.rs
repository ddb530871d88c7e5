// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Template evaluation for workflow definitions.
//!
//! Placeholders use the form `{{ .path }}` and evaluate against the
//! workflow context `{inputs, steps, item}` (`item` only inside a
//! `foreach` iteration). Leading-dot paths are normalized and rendered
//! through handlebars in strict mode, so missing references are errors.
//!
//! Boolean expressions (conditions and `foreach` guards) support `==`,
//! `!=`, string literals in single or double quotes, and bare
//! number/boolean literals. Both operands may themselves be templates.
//! A bare expression with no operator is evaluated for truthiness:
//! non-empty, not `"false"`, not `"0"`. These are the only extensions.

use crate::error::{EngineError, Result};
use handlebars::Handlebars;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn leading_dot_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*\.").expect("leading-dot regex"))
}

fn single_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\{\{\s*\.?([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}$")
            .expect("single-ref regex")
    })
}

fn step_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*\.?\s*steps\.([A-Za-z0-9_\-]+)").expect("step-ref regex")
    })
}

/// Extracts the step ids referenced as `steps.X` by a template string.
pub fn extract_step_refs(template: &str) -> Vec<String> {
    step_ref_re()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Whether a string contains any template placeholder.
pub fn has_placeholder(template: &str) -> bool {
    template.contains("{{")
}

/// Template engine over the workflow context.
pub struct TemplateEngine {
    registry: Handlebars<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Creates an engine with strict missing-reference handling.
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        Self { registry }
    }

    /// Renders a template to a string against the given context.
    pub fn render(&self, template: &str, ctx: &Value) -> Result<String> {
        if !has_placeholder(template) {
            return Ok(template.to_string());
        }

        // A template that is exactly one reference resolves through the
        // context directly so strings come out unquoted.
        if let Some(path) = Self::single_ref(template) {
            let value = Self::lookup(ctx, &path)
                .ok_or_else(|| EngineError::Template(format!("missing reference '{}'", path)))?;
            return Ok(value_to_string(value));
        }

        let normalized = leading_dot_re().replace_all(template, "{{");
        self.registry
            .render_template(&normalized, ctx)
            .map_err(|e| EngineError::Template(e.to_string()))
    }

    /// Evaluates a template to a JSON value, preserving the referenced
    /// value's type when the template is a single reference.
    pub fn evaluate_value(&self, template: &str, ctx: &Value) -> Result<Value> {
        if let Some(path) = Self::single_ref(template) {
            let value = Self::lookup(ctx, &path)
                .ok_or_else(|| EngineError::Template(format!("missing reference '{}'", path)))?;
            return Ok(value.clone());
        }
        Ok(Value::String(self.render(template, ctx)?))
    }

    /// Recursively evaluates templates inside a JSON value (strings become
    /// rendered, other leaves pass through).
    pub fn evaluate_map(&self, value: &Value, ctx: &Value) -> Result<Value> {
        match value {
            Value::String(s) => self.evaluate_value(s, ctx),
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|v| self.evaluate_map(v, ctx))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.evaluate_map(v, ctx)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Evaluates a boolean expression.
    pub fn evaluate_bool(&self, expression: &str, ctx: &Value) -> Result<bool> {
        if let Some((lhs, op, rhs)) = split_comparison(expression) {
            let left = self.evaluate_operand(lhs, ctx)?;
            let right = self.evaluate_operand(rhs, ctx)?;
            let equal = operands_equal(&left, &right);
            return Ok(if op == "==" { equal } else { !equal });
        }
        let value = self.evaluate_operand(expression, ctx)?;
        Ok(is_truthy(&value))
    }

    /// Evaluates a `foreach` expression to an iterable.
    pub fn evaluate_iterable(&self, expression: &str, ctx: &Value) -> Result<Vec<Value>> {
        match self.evaluate_value(expression.trim(), ctx)? {
            Value::Array(items) => Ok(items),
            other => Err(EngineError::Template(format!(
                "foreach expression did not produce an array (got {})",
                json_type_name(&other)
            ))),
        }
    }

    fn evaluate_operand(&self, operand: &str, ctx: &Value) -> Result<Value> {
        let trimmed = operand.trim();
        if trimmed.is_empty() {
            return Err(EngineError::Template("empty operand".to_string()));
        }
        if has_placeholder(trimmed) {
            return self.evaluate_value(trimmed, ctx);
        }
        if let Some(stripped) = strip_quotes(trimmed) {
            return Ok(Value::String(stripped.to_string()));
        }
        if trimmed == "true" {
            return Ok(Value::Bool(true));
        }
        if trimmed == "false" {
            return Ok(Value::Bool(false));
        }
        if let Ok(n) = trimmed.parse::<f64>() {
            if let Some(num) = serde_json::Number::from_f64(n) {
                return Ok(Value::Number(num));
            }
        }
        Ok(Value::String(trimmed.to_string()))
    }

    fn single_ref(template: &str) -> Option<String> {
        single_ref_re()
            .captures(template.trim())
            .map(|c| c[1].to_string())
    }

    fn lookup<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
        let mut current = ctx;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Splits `lhs == rhs` / `lhs != rhs` at the first operator that sits
/// outside quotes and outside `{{ }}`.
fn split_comparison(expression: &str) -> Option<(&str, &str, &str)> {
    let bytes = expression.as_bytes();
    let mut quote: Option<u8> = None;
    let mut brace_depth = 0usize;
    let mut i = 0;
    while i + 1 < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'{' if bytes[i + 1] == b'{' => {
                    brace_depth += 1;
                    i += 2;
                    continue;
                }
                b'}' if bytes[i + 1] == b'}' && brace_depth > 0 => {
                    brace_depth -= 1;
                    i += 2;
                    continue;
                }
                b'=' | b'!' if brace_depth == 0 && bytes[i + 1] == b'=' => {
                    let op = if b == b'=' { "==" } else { "!=" };
                    return Some((&expression[..i], op, &expression[i + 2..]));
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

fn strip_quotes(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return Some(&s[1..s.len() - 1]);
        }
    }
    None
}

fn operands_equal(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l == r;
    }
    value_to_string(left) == value_to_string(right)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
