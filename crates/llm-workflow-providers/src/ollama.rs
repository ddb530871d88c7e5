// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ollama provider implementation for local models.

use async_trait::async_trait;
use llm_workflow_core::providers::{
    ChatRequest, ChatResponse, LlmProvider, ProviderError, Role, ToolCall,
};
use llm_workflow_core::run::TokenUsage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Ollama API provider.
pub struct OllamaProvider {
    /// HTTP client.
    client: Client,
    /// API base URL.
    base_url: String,
}

/// Ollama chat request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ApiMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    function: ApiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionCall {
    name: String,
    arguments: Value,
}

/// Ollama chat response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    model: String,
    message: ApiMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

impl OllamaProvider {
    /// Creates a provider against the default local daemon.
    pub fn new() -> Self {
        Self::with_base_url("http://localhost:11434".to_string())
    }

    /// Creates a provider with a custom base URL.
    pub fn with_base_url(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, base_url }
    }

    /// Creates a provider from the `OLLAMA_HOST` environment variable,
    /// falling back to the local default.
    pub fn from_env() -> Self {
        match std::env::var("OLLAMA_HOST") {
            Ok(host) if !host.is_empty() => Self::with_base_url(host),
            _ => Self::new(),
        }
    }

    fn to_ollama_request(&self, request: &ChatRequest) -> OllamaChatRequest {
        let messages = request
            .messages
            .iter()
            .map(|message| ApiMessage {
                role: match message.role {
                    Role::System => "system".to_string(),
                    Role::User => "user".to_string(),
                    Role::Assistant => "assistant".to_string(),
                    Role::Tool => "tool".to_string(),
                },
                content: message.content.clone(),
                tool_calls: None,
            })
            .collect();

        let tools = request
            .tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.schema,
                    }
                })
            })
            .collect();

        let options = match (request.temperature, request.max_tokens) {
            (None, None) => None,
            (temperature, max_tokens) => Some(OllamaOptions {
                temperature,
                num_predict: max_tokens,
            }),
        };

        OllamaChatRequest {
            model: request.model.clone(),
            messages,
            stream: false,
            tools,
            options,
        }
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let ollama_request = self.to_ollama_request(&request);

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&ollama_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("Failed to read response body"));

        if !status.is_success() {
            return Err(ProviderError::HttpError(format!(
                "[{}] {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: OllamaChatResponse = serde_json::from_str(&body)?;

        // Ollama does not assign call ids; synthesize them so tool-role
        // replies can link back.
        let tool_calls: Vec<ToolCall> = parsed
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall {
                id: format!("call_{}", Uuid::new_v4().simple()),
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect();

        let finish_reason = if !tool_calls.is_empty() {
            "tool_calls".to_string()
        } else {
            match parsed.done_reason.as_deref() {
                Some("length") => "length".to_string(),
                _ => "stop".to_string(),
            }
        };

        Ok(ChatResponse {
            content: parsed.message.content,
            finish_reason,
            tool_calls,
            model: parsed.model,
            usage: TokenUsage {
                input_tokens: parsed.prompt_eval_count,
                output_tokens: parsed.eval_count,
                total_tokens: parsed.prompt_eval_count + parsed.eval_count,
                ..Default::default()
            },
        })
    }

    fn name(&self) -> &str {
        "ollama"
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|e| ProviderError::HttpError(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::HttpError(format!(
                "ollama answered {}",
                response.status()
            )))
        }
    }
}
