// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provider trait definitions and conversation types.
//!
//! The core never names a vendor: concrete adapters live in the providers
//! crate and implement [`LlmProvider`] over a message-based chat contract.

use crate::run::TokenUsage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool result linked to a prior call.
    Tool,
}

/// A single conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the author.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Tool calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool-role messages, the id of the call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    /// An assistant message, optionally carrying tool calls.
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// A tool-role message answering `call_id`.
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id, echoed back by the tool-role reply.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments as returned by the model.
    pub arguments: Value,
}

/// A tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON schema of the tool's inputs.
    pub schema: Value,
}

/// Chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model name.
    pub model: String,
    /// Conversation so far.
    pub messages: Vec<Message>,
    /// Tools the model may call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Completion token cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Generated text.
    pub content: String,
    /// Why generation stopped: `stop`, `tool_calls`, `length`, or a
    /// provider-specific value.
    pub finish_reason: String,
    /// Tool calls requested by the model, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Model that produced the response.
    pub model: String,
    /// Token usage for this exchange.
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Incremental chunk from a streaming provider.
///
/// Exactly one chunk carries the terminal `response`; it is the last one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Text fragment, absent on the terminal chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    /// The assembled response, present only on the terminal chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ChatResponse>,
}

impl StreamChunk {
    /// A delta chunk.
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            delta: Some(content.into()),
            response: None,
        }
    }

    /// The terminal chunk carrying the assembled response.
    pub fn done(response: ChatResponse) -> Self {
        Self {
            delta: None,
            response: Some(response),
        }
    }
}

/// Provider error.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request error.
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    /// Authentication error.
    #[error("authentication failed: {0}")]
    AuthError(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Provider-specific error.
    #[error("provider error: {0}")]
    ProviderSpecific(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Request timed out.
    #[error("request timed out")]
    Timeout,

    /// The provider does not implement token streaming.
    #[error("streaming not supported")]
    StreamingUnsupported,

    /// Unknown error.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded | Self::Timeout | Self::HttpError(_) | Self::Unknown(_)
        )
    }

    /// Coarse category for user-safe display.
    pub fn category(&self) -> &'static str {
        match self {
            Self::HttpError(_) => "http",
            Self::AuthError(_) => "auth",
            Self::RateLimitExceeded => "rate_limit",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ProviderSpecific(_) => "provider",
            Self::SerializationError(_) => "serialization",
            Self::Timeout => "timeout",
            Self::StreamingUnsupported => "unsupported",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// LLM provider trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generates a chat completion.
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Provider name.
    fn name(&self) -> &str;

    /// Streams token deltas for a request, ending with a terminal chunk
    /// that carries the assembled response. Optional; the engine works
    /// without it and forwards deltas as `llm.token` events when present.
    async fn stream(
        &self,
        _request: ChatRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>, ProviderError> {
        Err(ProviderError::StreamingUnsupported)
    }

    /// Checks that the provider is reachable.
    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
