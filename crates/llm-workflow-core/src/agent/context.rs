// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token estimation and history pruning for agent conversations.
//!
//! Estimates are the character heuristic (`ceil(len / 4)`) plus fixed
//! per-message and per-tool-call overheads. They only need to be good
//! enough to keep the conversation inside the provider's window; callers
//! must tolerate under-counts by the underlying provider.

use crate::providers::Message;
use serde_json::Value;

const MESSAGE_OVERHEAD: usize = 10;
const TOOL_CALL_OVERHEAD: usize = 20;

/// Keeps an agent conversation within a configured token window.
#[derive(Debug, Clone, Copy)]
pub struct ContextManager {
    max_tokens: usize,
    prune_threshold: usize,
}

impl ContextManager {
    /// Creates a manager for the given window. Pruning triggers at 80%
    /// of the window.
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            prune_threshold: max_tokens * 8 / 10,
        }
    }

    /// The configured window.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// The pruning trigger point.
    pub fn prune_threshold(&self) -> usize {
        self.prune_threshold
    }

    /// Estimated tokens for one message.
    pub fn estimate_message(&self, message: &Message) -> usize {
        let mut total = estimate_str(&message.content) + MESSAGE_OVERHEAD;
        for call in &message.tool_calls {
            total += estimate_str(&call.name) + TOOL_CALL_OVERHEAD + estimate_value(&call.arguments);
        }
        total
    }

    /// Estimated tokens for a whole conversation.
    pub fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }

    /// Whether the conversation exceeds the prune threshold.
    pub fn should_prune(&self, messages: &[Message]) -> bool {
        self.estimate_messages(messages) > self.prune_threshold
    }

    /// Returns a pruned conversation: the system prompt (`messages[0]`) is
    /// always preserved, followed by the newest messages, in their original
    /// order, that fit in the remaining budget. Older middle messages are
    /// dropped. Empty input returns empty.
    pub fn prune(&self, messages: &[Message]) -> Vec<Message> {
        let Some((first, rest)) = messages.split_first() else {
            return Vec::new();
        };

        let mut budget = self
            .max_tokens
            .saturating_sub(self.estimate_message(first));

        // Walk from the newest backwards, keeping whatever still fits.
        let mut kept: Vec<&Message> = Vec::new();
        for message in rest.iter().rev() {
            let cost = self.estimate_message(message);
            if cost > budget {
                break;
            }
            budget -= cost;
            kept.push(message);
        }

        let mut result = Vec::with_capacity(kept.len() + 1);
        result.push(first.clone());
        result.extend(kept.into_iter().rev().cloned());
        result
    }

    /// Reduces a single string to fit a token budget, cutting at the last
    /// whitespace boundary below the character budget and appending `...`.
    pub fn truncate_content(&self, content: &str, max_tokens: usize) -> String {
        if estimate_str(content) <= max_tokens {
            return content.to_string();
        }

        let char_budget = max_tokens.saturating_mul(4);
        let mut cut = char_budget.min(content.len());
        while cut > 0 && !content.is_char_boundary(cut) {
            cut -= 1;
        }

        let head = &content[..cut];
        let boundary = head
            .rfind(|c: char| c.is_whitespace())
            .unwrap_or(head.len());
        format!("{}...", head[..boundary].trim_end())
    }
}

fn estimate_str(s: &str) -> usize {
    s.len().div_ceil(4)
}

/// Recursive argument estimate: strings by the character heuristic,
/// primitives count as 1, containers sum their parts (map keys included).
fn estimate_value(value: &Value) -> usize {
    match value {
        Value::String(s) => estimate_str(s),
        Value::Null | Value::Bool(_) | Value::Number(_) => 1,
        Value::Array(items) => items.iter().map(estimate_value).sum(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| estimate_str(k) + estimate_value(v))
            .sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ToolCall;
    use serde_json::json;

    fn msg(content: &str) -> Message {
        Message::user(content)
    }

    #[test]
    fn test_estimate_includes_overhead() {
        let manager = ContextManager::new(1000);
        // 8 chars -> 2 tokens, plus 10 overhead.
        assert_eq!(manager.estimate_message(&msg("12345678")), 12);
    }

    #[test]
    fn test_estimate_tool_calls() {
        let manager = ContextManager::new(1000);
        let message = Message::assistant(
            "",
            vec![ToolCall {
                id: "c1".to_string(),
                name: "grep".to_string(), // 1 token
                arguments: json!({"path": "src", "count": 3}),
            }],
        );
        // content 0 + 10 overhead + name 1 + 20 overhead
        // + args: "path"(1) + "src"(1) + "count"(2) + 3(1) = 5
        assert_eq!(manager.estimate_message(&message), 36);
    }

    #[test]
    fn test_prune_threshold_is_80_percent() {
        let manager = ContextManager::new(100);
        assert_eq!(manager.prune_threshold(), 80);
        let manager = ContextManager::new(101);
        assert_eq!(manager.prune_threshold(), 80);
    }

    #[test]
    fn test_prune_keeps_system_and_newest() {
        let manager = ContextManager::new(40);
        let messages = vec![
            Message::system("sys"),        // 11 tokens
            msg("old message number one"), // dropped
            msg("old message number two"), // dropped
            msg("recent-a"),               // 12 tokens
            msg("recent-b"),               // 12 tokens
        ];

        let pruned = manager.prune(&messages);
        assert_eq!(pruned[0].content, "sys");
        let contents: Vec<&str> = pruned.iter().map(|m| m.content.as_str()).collect();
        // Newest messages survive in original order.
        assert_eq!(contents, vec!["sys", "recent-a", "recent-b"]);
        assert!(manager.estimate_messages(&pruned) <= manager.max_tokens());
    }

    #[test]
    fn test_prune_empty_returns_empty() {
        let manager = ContextManager::new(100);
        assert!(manager.prune(&[]).is_empty());
    }

    #[test]
    fn test_prune_preserves_first_even_alone() {
        let manager = ContextManager::new(12);
        let messages = vec![Message::system("a system prompt"), msg("anything else")];
        let pruned = manager.prune(&messages);
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].content, "a system prompt");
    }

    #[test]
    fn test_should_prune() {
        let manager = ContextManager::new(30);
        let small = vec![msg("hi")];
        assert!(!manager.should_prune(&small));

        let big = vec![msg("hi"), msg("a much longer message body here")];
        assert!(manager.should_prune(&big));
    }

    #[test]
    fn test_truncate_content_cuts_at_whitespace() {
        let manager = ContextManager::new(1000);
        let content = "alpha beta gamma delta epsilon";
        let out = manager.truncate_content(content, 4); // 16-char budget
        assert!(out.ends_with("..."));
        assert!(out.len() <= 19);
        // The cut lands on a word boundary.
        assert_eq!(out, "alpha beta...");
    }

    #[test]
    fn test_truncate_content_unchanged_when_fits() {
        let manager = ContextManager::new(1000);
        assert_eq!(manager.truncate_content("short", 10), "short");
    }
}
