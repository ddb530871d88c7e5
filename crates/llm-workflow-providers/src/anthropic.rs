// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Anthropic (Claude) provider implementation.

use async_trait::async_trait;
use llm_workflow_core::providers::{
    ChatRequest, ChatResponse, LlmProvider, Message, ProviderError, Role, ToolCall,
};
use llm_workflow_core::run::TokenUsage;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Anthropic API provider.
pub struct AnthropicProvider {
    /// HTTP client.
    client: Client,
    /// API key.
    api_key: String,
    /// API base URL.
    base_url: String,
    /// Default API version.
    api_version: String,
}

/// Anthropic messages request.
#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<ApiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
}

/// Message in the conversation.
#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: Vec<ContentBlockOut>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockOut {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

/// Tool definition advertised to the model.
#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: Value,
}

/// Anthropic messages response.
#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[allow(dead_code)]
    id: String,
    content: Vec<ContentBlockIn>,
    model: String,
    stop_reason: Option<String>,
    usage: Usage,
}

/// Content block in a response.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockIn {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

/// Token usage information.
#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

/// Anthropic error response.
#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

impl AnthropicProvider {
    /// Converts a reqwest error to a ProviderError.
    fn convert_reqwest_error(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::HttpError(err.to_string())
        }
    }

    /// Creates a new Anthropic provider.
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(
            api_key,
            "https://api.anthropic.com/v1".to_string(),
            "2023-06-01".to_string(),
        )
    }

    /// Creates a new Anthropic provider with custom base URL and API version.
    pub fn with_base_url(api_key: String, base_url: String, api_version: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            base_url,
            api_version,
        }
    }

    /// Creates a new Anthropic provider from the `ANTHROPIC_API_KEY`
    /// environment variable.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            ProviderError::InvalidRequest(
                "ANTHROPIC_API_KEY environment variable not set".to_string(),
            )
        })?;

        Ok(Self::new(api_key))
    }

    /// Converts an engine chat request to Anthropic wire format.
    ///
    /// The system message is lifted into the top-level `system` field;
    /// tool-role messages become `tool_result` blocks on a user turn.
    fn to_anthropic_request(&self, request: &ChatRequest) -> MessagesRequest {
        let mut system = None;
        let mut messages: Vec<ApiMessage> = Vec::new();

        for message in &request.messages {
            match message.role {
                Role::System => system = Some(message.content.clone()),
                Role::User => messages.push(ApiMessage {
                    role: "user".to_string(),
                    content: vec![ContentBlockOut::Text {
                        text: message.content.clone(),
                    }],
                }),
                Role::Assistant => {
                    let mut content = Vec::new();
                    if !message.content.is_empty() {
                        content.push(ContentBlockOut::Text {
                            text: message.content.clone(),
                        });
                    }
                    for call in &message.tool_calls {
                        content.push(ContentBlockOut::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.arguments.clone(),
                        });
                    }
                    messages.push(ApiMessage {
                        role: "assistant".to_string(),
                        content,
                    });
                }
                Role::Tool => messages.push(ApiMessage {
                    role: "user".to_string(),
                    content: vec![ContentBlockOut::ToolResult {
                        tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                        content: message.content.clone(),
                    }],
                }),
            }
        }

        let tools = request
            .tools
            .iter()
            .map(|tool| ApiTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.schema.clone(),
            })
            .collect();

        MessagesRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(1024),
            system,
            temperature: request.temperature,
            tools,
        }
    }

    /// Parses an error response from Anthropic.
    fn parse_error(&self, status: StatusCode, body: &str) -> ProviderError {
        if let Ok(error_response) = serde_json::from_str::<AnthropicErrorResponse>(body) {
            let error = error_response.error;

            if status == StatusCode::TOO_MANY_REQUESTS || error.error_type == "rate_limit_error" {
                return ProviderError::RateLimitExceeded;
            }

            if status == StatusCode::UNAUTHORIZED
                || status == StatusCode::FORBIDDEN
                || error.error_type == "authentication_error"
                || error.error_type == "permission_error"
            {
                return ProviderError::AuthError(error.message);
            }

            if error.error_type == "invalid_request_error" {
                return ProviderError::InvalidRequest(error.message);
            }

            return ProviderError::ProviderSpecific(format!(
                "[{}] {}: {}",
                status.as_u16(),
                error.error_type,
                error.message
            ));
        }

        ProviderError::HttpError(format!("[{}] {}", status.as_u16(), body))
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let anthropic_request = self.to_anthropic_request(&request);

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("Content-Type", "application/json")
            .json(&anthropic_request)
            .send()
            .await
            .map_err(Self::convert_reqwest_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("Failed to read response body"));

        if !status.is_success() {
            return Err(self.parse_error(status, &body));
        }

        let messages_response: MessagesResponse = serde_json::from_str(&body)?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in messages_response.content {
            match block {
                ContentBlockIn::Text { text: t } => text.push_str(&t),
                ContentBlockIn::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input,
                }),
                ContentBlockIn::Other => {}
            }
        }

        let finish_reason = match messages_response.stop_reason.as_deref() {
            Some("end_turn") | Some("stop_sequence") => "stop".to_string(),
            Some("tool_use") => "tool_calls".to_string(),
            Some("max_tokens") => "length".to_string(),
            Some(other) => other.to_string(),
            None => "stop".to_string(),
        };

        let usage = TokenUsage {
            input_tokens: messages_response.usage.input_tokens,
            output_tokens: messages_response.usage.output_tokens,
            cache_read_tokens: messages_response.usage.cache_read_input_tokens,
            cache_write_tokens: messages_response.usage.cache_creation_input_tokens,
            total_tokens: messages_response.usage.input_tokens
                + messages_response.usage.output_tokens,
        };

        Ok(ChatResponse {
            content: text,
            finish_reason,
            tool_calls,
            model: messages_response.model,
            usage,
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        // No dedicated health endpoint; a minimal completion stands in.
        let request = ChatRequest {
            model: "claude-3-haiku-20240307".to_string(),
            messages: vec![Message::user("Hi")],
            tools: Vec::new(),
            temperature: None,
            max_tokens: Some(5),
        };

        self.complete(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_creation() {
        let provider = AnthropicProvider::new("test-key".to_string());
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.base_url, "https://api.anthropic.com/v1");
    }

    #[test]
    fn test_to_anthropic_request_lifts_system() {
        let provider = AnthropicProvider::new("test-key".to_string());
        let request = ChatRequest {
            model: "claude-3-opus-20240229".to_string(),
            messages: vec![
                Message::system("You are a helpful assistant"),
                Message::user("Hello, world!"),
            ],
            tools: Vec::new(),
            temperature: Some(0.7),
            max_tokens: Some(100),
        };

        let wire = provider.to_anthropic_request(&request);
        assert_eq!(wire.system.as_deref(), Some("You are a helpful assistant"));
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.messages[0].role, "user");
        assert_eq!(wire.max_tokens, 100);
    }

    #[test]
    fn test_tool_round_trip_wire_shape() {
        let provider = AnthropicProvider::new("test-key".to_string());
        let request = ChatRequest {
            model: "claude-3-opus-20240229".to_string(),
            messages: vec![
                Message::user("search please"),
                Message::assistant(
                    "",
                    vec![ToolCall {
                        id: "toolu_1".to_string(),
                        name: "search".to_string(),
                        arguments: json!({"q": "rust"}),
                    }],
                ),
                Message::tool("toolu_1", r#"{"hits": 3}"#),
            ],
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
        };

        let wire = provider.to_anthropic_request(&request);
        let body = serde_json::to_value(&wire).unwrap();

        assert_eq!(body["messages"][1]["content"][0]["type"], "tool_use");
        assert_eq!(body["messages"][1]["content"][0]["id"], "toolu_1");
        // Tool replies travel as tool_result blocks on a user turn.
        assert_eq!(body["messages"][2]["role"], "user");
        assert_eq!(body["messages"][2]["content"][0]["type"], "tool_result");
        assert_eq!(
            body["messages"][2]["content"][0]["tool_use_id"],
            "toolu_1"
        );
    }

    #[test]
    fn test_parse_tool_use_response() {
        let body = r#"{
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "Let me look."},
                {"type": "tool_use", "id": "toolu_9", "name": "search", "input": {"q": "rust"}}
            ],
            "model": "claude-3-opus-20240229",
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 8}
        }"#;
        let parsed: MessagesResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.usage.input_tokens, 12);
        match &parsed.content[1] {
            ContentBlockIn::ToolUse { name, .. } => assert_eq!(name, "search"),
            other => panic!("expected tool_use, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rate_limit_error() {
        let provider = AnthropicProvider::new("test-key".to_string());
        let error_json = r#"{
            "error": {"type": "rate_limit_error", "message": "Rate limit exceeded"}
        }"#;
        let error = provider.parse_error(StatusCode::TOO_MANY_REQUESTS, error_json);
        assert!(matches!(error, ProviderError::RateLimitExceeded));
    }

    #[test]
    fn test_parse_auth_error() {
        let provider = AnthropicProvider::new("test-key".to_string());
        let error_json = r#"{
            "error": {"type": "authentication_error", "message": "Invalid API key"}
        }"#;
        let error = provider.parse_error(StatusCode::UNAUTHORIZED, error_json);
        match error {
            ProviderError::AuthError(msg) => assert_eq!(msg, "Invalid API key"),
            _ => panic!("Expected AuthError"),
        }
    }

    #[tokio::test]
    async fn test_complete_against_mock_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/messages")
            .match_header("x-api-key", "test-key")
            .with_status(200)
            .with_body(
                r#"{
                    "id": "msg_1",
                    "content": [{"type": "text", "text": "hello back"}],
                    "model": "claude-3-haiku-20240307",
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 10, "output_tokens": 5}
                }"#,
            )
            .create_async()
            .await;

        let provider = AnthropicProvider::with_base_url(
            "test-key".to_string(),
            server.url(),
            "2023-06-01".to_string(),
        );
        let response = provider
            .complete(ChatRequest {
                model: "claude-3-haiku-20240307".to_string(),
                messages: vec![Message::user("hello")],
                tools: Vec::new(),
                temperature: None,
                max_tokens: Some(16),
            })
            .await
            .unwrap();

        assert_eq!(response.content, "hello back");
        assert_eq!(response.finish_reason, "stop");
        assert_eq!(response.usage.total_tokens, 15);
        mock.assert_async().await;
    }
}
