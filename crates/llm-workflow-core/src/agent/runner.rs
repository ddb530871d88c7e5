// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The agent execution loop.
//!
//! One iteration: call the LLM, roll usage into the budget, append the
//! assistant message, then dispatch requested tool calls strictly in
//! order. Each tool's chunk stream is drained to completion before the
//! next tool starts, so output interleaving is deterministic. Between
//! iterations the conversation is pruned when it outgrows the context
//! window.

use super::{AgentConfig, AgentResult, AgentStatus, ContextManager, StopReason, ToolExecution};
use crate::error::{EngineError, Result};
use crate::events::{Event, EventKind, EventPayload};
use crate::providers::{ChatRequest, ChatResponse, LlmProvider, Message, ToolCall, ToolSpec};
use crate::run::TokenUsage;
use crate::tools::{ToolChunk, ToolRegistry};
use serde_json::{Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Synchronous event sink for streaming observation.
pub type EventSink = Arc<dyn Fn(&Event) + Send + Sync>;

/// Drives an agent run to completion.
pub struct AgentRunner {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    model: String,
    allowed_tools: Vec<String>,
    config: AgentConfig,
    context: ContextManager,
    events: Option<EventSink>,
    workflow_id: String,
    step_id: Option<String>,
    cancel: CancellationToken,
}

impl AgentRunner {
    /// Creates a runner with default configuration and no tools allowed.
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        model: impl Into<String>,
    ) -> Self {
        let config = AgentConfig::default();
        Self {
            provider,
            registry,
            model: model.into(),
            allowed_tools: Vec::new(),
            context: ContextManager::new(config.context_window),
            config,
            events: None,
            workflow_id: "agent".to_string(),
            step_id: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Restricts the agent to the named tools.
    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }

    /// Applies an agent configuration.
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.context = ContextManager::new(config.context_window);
        self.config = config;
        self
    }

    /// Attaches a streaming event sink.
    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    /// Tags emitted events with a workflow and step id.
    pub fn with_event_scope(mut self, workflow_id: impl Into<String>, step_id: Option<String>) -> Self {
        self.workflow_id = workflow_id.into();
        self.step_id = step_id;
        self
    }

    /// Attaches a cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs the agent loop.
    ///
    /// Terminal LLM and tool failures are reported in the returned
    /// [`AgentResult`]; only cancellation surfaces as an `Err`.
    pub async fn run(&self, system_prompt: &str, user_prompt: &str) -> Result<AgentResult> {
        let started = Instant::now();
        let mut conversation = vec![Message::system(system_prompt), Message::user(user_prompt)];
        let specs = self.registry.specs_for(&self.allowed_tools);

        let mut iterations = 0u32;
        let mut tokens_used = TokenUsage::zero();
        let mut tool_executions: Vec<ToolExecution> = Vec::new();
        let mut last_content = String::new();

        info!(
            model = %self.model,
            tools = specs.len(),
            max_iterations = self.config.max_iterations,
            "Starting agent run"
        );

        while iterations < self.config.max_iterations {
            iterations += 1;
            self.emit(
                EventKind::AgentIteration,
                EventPayload::AgentIteration {
                    iteration: iterations,
                    tokens_used: tokens_used.total_tokens,
                },
            );

            let response = match self.complete(&conversation, &specs).await {
                Ok(response) => response,
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) => {
                    warn!(iteration = iterations, error = %err, "LLM call failed");
                    return Ok(self.finish(
                        AgentStatus::Error,
                        StopReason::LlmError,
                        last_content,
                        tool_executions,
                        iterations,
                        tokens_used,
                        started,
                        Some(err.to_string()),
                    ));
                }
            };

            tokens_used += response.usage;
            last_content = response.content.clone();

            // The budget check happens after each LLM call; the response
            // that crossed the line is kept as the final content.
            if self.config.token_limit > 0 && tokens_used.total_tokens > self.config.token_limit {
                debug!(
                    total = tokens_used.total_tokens,
                    limit = self.config.token_limit,
                    "Agent token limit exceeded"
                );
                return Ok(self.finish(
                    AgentStatus::LimitExceeded,
                    StopReason::TokenLimit,
                    response.content,
                    tool_executions,
                    iterations,
                    tokens_used,
                    started,
                    None,
                ));
            }

            conversation.push(Message::assistant(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            if response.finish_reason == "stop" && response.tool_calls.is_empty() {
                return Ok(self.finish(
                    AgentStatus::Completed,
                    StopReason::TaskCompleted,
                    response.content,
                    tool_executions,
                    iterations,
                    tokens_used,
                    started,
                    None,
                ));
            }

            // Dispatch tool calls sequentially in response order.
            for call in &response.tool_calls {
                self.emit(
                    EventKind::LlmToolCall,
                    EventPayload::ToolCall {
                        call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                );

                let execution = self.dispatch_tool(call).await?;

                conversation.push(Message::tool(&call.id, tool_reply(&execution)));
                self.emit(
                    EventKind::LlmToolResult,
                    EventPayload::ToolResult {
                        call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        success: execution.success,
                    },
                );

                let failed = !execution.success;
                let error = execution.error.clone();
                tool_executions.push(execution);

                if failed && self.config.stop_on_error {
                    return Ok(self.finish(
                        AgentStatus::Error,
                        StopReason::ToolError,
                        last_content,
                        tool_executions,
                        iterations,
                        tokens_used,
                        started,
                        error,
                    ));
                }
            }

            if self.context.should_prune(&conversation) {
                let before = conversation.len();
                conversation = self.context.prune(&conversation);
                debug!(before, after = conversation.len(), "Pruned agent conversation");
            }
        }

        Ok(self.finish(
            AgentStatus::LimitExceeded,
            StopReason::MaxIterations,
            last_content,
            tool_executions,
            iterations,
            tokens_used,
            started,
            None,
        ))
    }

    /// Calls the provider, streaming token deltas into the event feed when
    /// the provider supports it.
    async fn complete(&self, conversation: &[Message], specs: &[ToolSpec]) -> Result<ChatResponse> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: conversation.to_vec(),
            tools: specs.to_vec(),
            temperature: None,
            max_tokens: None,
        };

        if self.events.is_some() {
            match self.provider.stream(request.clone()).await {
                Ok(mut rx) => {
                    loop {
                        let chunk = tokio::select! {
                            _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                            chunk = rx.recv() => chunk,
                        };
                        match chunk {
                            Some(chunk) => {
                                if let Some(delta) = chunk.delta {
                                    self.emit(
                                        EventKind::LlmToken,
                                        EventPayload::LlmToken { delta },
                                    );
                                }
                                if let Some(response) = chunk.response {
                                    return Ok(response);
                                }
                            }
                            None => {
                                return Err(EngineError::Provider(
                                    crate::providers::ProviderError::Unknown(
                                        "stream ended without a terminal chunk".to_string(),
                                    ),
                                ))
                            }
                        }
                    }
                }
                Err(crate::providers::ProviderError::StreamingUnsupported) => {}
                Err(err) => return Err(EngineError::Provider(err)),
            }
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            response = self.provider.complete(request) => {
                response.map_err(EngineError::Provider)
            }
        }
    }

    /// Executes one tool call, draining its chunk stream fully.
    async fn dispatch_tool(&self, call: &ToolCall) -> Result<ToolExecution> {
        let started = Instant::now();

        let inputs = match normalize_arguments(&call.arguments) {
            Ok(inputs) => inputs,
            Err(reason) => {
                return Ok(ToolExecution {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    inputs: Map::new(),
                    outputs: None,
                    error: Some(format!("invalid_arguments: {}", reason)),
                    success: false,
                    duration: started.elapsed(),
                    chunks: Vec::new(),
                });
            }
        };

        let mut rx = match self
            .registry
            .execute_stream(&call.name, inputs.clone(), &call.id, self.cancel.child_token())
            .await
        {
            Ok(rx) => rx,
            Err(err) => {
                return Ok(ToolExecution {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    inputs,
                    outputs: None,
                    error: Some(err.to_string()),
                    success: false,
                    duration: started.elapsed(),
                    chunks: Vec::new(),
                });
            }
        };

        let mut chunks: Vec<ToolChunk> = Vec::new();
        let mut outputs: Option<Map<String, Value>> = None;
        let mut error: Option<String> = None;

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                chunk = rx.recv() => chunk,
            };
            let Some(chunk) = chunk else { break };

            self.emit(
                EventKind::ToolOutput,
                EventPayload::ToolOutput {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    stream: chunk.stream.clone(),
                    data: chunk.data.clone(),
                    is_final: chunk.is_final,
                    metadata: chunk.metadata.clone(),
                },
            );

            let is_final = chunk.is_final;
            if is_final {
                outputs = chunk.result.clone();
                error = chunk.error.clone();
            }
            chunks.push(chunk);
            if is_final {
                break;
            }
        }

        let success = error.is_none();
        Ok(ToolExecution {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            inputs,
            outputs,
            error,
            success,
            duration: started.elapsed(),
            chunks,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        status: AgentStatus,
        reason: StopReason,
        final_response: String,
        tool_executions: Vec<ToolExecution>,
        iterations: u32,
        tokens_used: TokenUsage,
        started: Instant,
        error: Option<String>,
    ) -> AgentResult {
        info!(
            status = ?status,
            reason = ?reason,
            iterations,
            total_tokens = tokens_used.total_tokens,
            "Agent run finished"
        );
        AgentResult {
            status,
            reason,
            final_response,
            tool_executions,
            iterations,
            tokens_used,
            duration: started.elapsed(),
            error,
        }
    }

    /// Emits synchronously; sink panics are recovered and logged so they
    /// neither abort the loop nor lose subsequent events.
    fn emit(&self, kind: EventKind, payload: EventPayload) {
        if let Some(sink) = &self.events {
            let event = Event::new(kind, &self.workflow_id, self.step_id.clone(), payload);
            if catch_unwind(AssertUnwindSafe(|| sink(&event))).is_err() {
                warn!(event = kind.as_str(), "Agent event sink panicked");
            }
        }
    }
}

/// Normalizes model-supplied arguments into a tool inputs map: maps pass
/// through, strings wrap as `{raw: ...}`, anything else is rejected.
fn normalize_arguments(arguments: &Value) -> std::result::Result<Map<String, Value>, String> {
    match arguments {
        Value::Object(map) => Ok(map.clone()),
        Value::String(s) => {
            let mut map = Map::new();
            map.insert("raw".to_string(), Value::String(s.clone()));
            Ok(map)
        }
        other => Err(format!("expected object or string, got {}", type_name(other))),
    }
}

fn tool_reply(execution: &ToolExecution) -> String {
    match (&execution.outputs, &execution.error) {
        (_, Some(error)) => format!("error: {}", error),
        (Some(outputs), None) => {
            serde_json::to_string(outputs).unwrap_or_else(|_| "{}".to_string())
        }
        (None, None) => "{}".to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
