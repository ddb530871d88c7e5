// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Redaction of sensitive fields in context snapshots.
//!
//! Applied before a context snapshot leaves the process (events, debug
//! observers). String values under sensitive-looking keys are replaced;
//! maps and arrays are walked recursively. Checkpoints are not redacted:
//! they must stay resumable.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const REDACTED: &str = "[REDACTED]";

fn sensitive_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(api[_-]?key|secret|token|password|credential|authorization)")
            .expect("sensitive-key regex")
    })
}

fn sensitive_value_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Bearer headers and common provider key prefixes.
    RE.get_or_init(|| Regex::new(r"^(Bearer\s+\S+|sk-[A-Za-z0-9_-]{8,})$").expect("value regex"))
}

/// Returns a copy of `value` with sensitive fields replaced.
pub fn redact_value(value: &Value) -> Value {
    let mut copy = value.clone();
    redact_in_place(&mut copy);
    copy
}

/// Redacts sensitive fields in place.
pub fn redact_in_place(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if sensitive_key_re().is_match(key) && entry.is_string() {
                    *entry = Value::String(REDACTED.to_string());
                } else {
                    redact_in_place(entry);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_in_place),
        Value::String(s) => {
            if sensitive_value_re().is_match(s) {
                *s = REDACTED.to_string();
            }
        }
        _ => {}
    }
}
