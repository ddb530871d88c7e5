// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared test doubles: scripted providers and simple tools.

use async_trait::async_trait;
use llm_workflow_core::providers::{ChatRequest, ChatResponse, LlmProvider, ProviderError, ToolCall};
use llm_workflow_core::run::TokenUsage;
use llm_workflow_core::tools::Tool;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;

/// Builds a response with the given text, finish reason and total tokens.
pub fn response(content: &str, finish_reason: &str, total_tokens: u64) -> ChatResponse {
    ChatResponse {
        content: content.to_string(),
        finish_reason: finish_reason.to_string(),
        tool_calls: Vec::new(),
        model: "mock".to_string(),
        usage: TokenUsage {
            input_tokens: total_tokens * 2 / 3,
            output_tokens: total_tokens - total_tokens * 2 / 3,
            total_tokens,
            ..Default::default()
        },
    }
}

/// A response that requests tool calls.
pub fn tool_call_response(calls: Vec<ToolCall>, total_tokens: u64) -> ChatResponse {
    ChatResponse {
        tool_calls: calls,
        ..response("", "tool_calls", total_tokens)
    }
}

/// Provider that replays a script of responses. When the script runs dry
/// the last response repeats.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ChatResponse>>,
    last: Mutex<Option<ChatResponse>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(response: ChatResponse) -> Self {
        let provider = Self::new(vec![response.clone()]);
        *provider.last.lock() = Some(response);
        provider
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        if let Some(user) = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == llm_workflow_core::providers::Role::User)
        {
            self.prompts.lock().push(user.content.clone());
        }

        if let Some(next) = self.script.lock().pop_front() {
            *self.last.lock() = Some(next.clone());
            return Ok(next);
        }
        self.last
            .lock()
            .clone()
            .ok_or_else(|| ProviderError::Unknown("script exhausted".to_string()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Provider that echoes the user prompt back as the response content.
pub struct EchoProvider;

#[async_trait]
impl LlmProvider for EchoProvider {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == llm_workflow_core::providers::Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(response(&format!("echo: {}", prompt), "stop", 4))
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Tool that returns a fixed result map.
pub struct FixedTool {
    name: String,
    result: Map<String, Value>,
    pub calls: Arc<Mutex<Vec<Map<String, Value>>>>,
}

impl FixedTool {
    pub fn new(name: &str, result: Map<String, Value>) -> Self {
        Self {
            name: name.to_string(),
            result,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Tool for FixedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Returns a fixed result"
    }

    fn schema(&self) -> Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, inputs: Map<String, Value>) -> Result<Map<String, Value>, String> {
        self.calls.lock().push(inputs);
        Ok(self.result.clone())
    }
}
