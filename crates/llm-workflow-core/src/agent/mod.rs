// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Agent loop: an iterative LLM-plus-tool controller.
//!
//! The controller repeatedly calls an LLM, dispatches requested tool calls
//! (streaming their chunks into the event feed), appends results to the
//! conversation, prunes context when over budget, and terminates on a stop
//! condition, iteration cap, token cap, or tool error.

mod context;
mod runner;

pub use context::ContextManager;
pub use runner::{AgentRunner, EventSink};

use crate::run::TokenUsage;
use crate::tools::ToolChunk;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Default iteration cap.
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;

/// Default conversation context window, in estimated tokens.
pub const DEFAULT_CONTEXT_WINDOW: usize = 128_000;

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Iteration cap.
    pub max_iterations: u32,
    /// Cumulative token limit for the run (0 = unlimited).
    pub token_limit: u64,
    /// Terminate when a tool call errors.
    pub stop_on_error: bool,
    /// Conversation window in estimated tokens.
    pub context_window: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            token_limit: 0,
            stop_on_error: false,
            context_window: DEFAULT_CONTEXT_WINDOW,
        }
    }
}

/// Terminal status of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// The model produced a final answer.
    Completed,
    /// An iteration or token cap ended the run.
    LimitExceeded,
    /// An LLM or tool failure ended the run.
    Error,
}

/// Why the run terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural stop with no pending tool calls.
    TaskCompleted,
    /// Iteration cap reached.
    MaxIterations,
    /// Token budget exhausted.
    TokenLimit,
    /// A tool errored with `stop_on_error` set.
    ToolError,
    /// The provider call failed.
    LlmError,
}

/// Record of one tool invocation during an agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    /// Call id assigned by the model.
    pub call_id: String,
    /// Tool name.
    pub tool_name: String,
    /// Normalized inputs the tool received.
    pub inputs: Map<String, Value>,
    /// Result map from the final chunk, when successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Map<String, Value>>,
    /// Runtime error from the final chunk, when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Wall-clock duration of the invocation.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Ordered chunk log, including the final chunk.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<ToolChunk>,
}

/// Result of an agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    /// Terminal status.
    pub status: AgentStatus,
    /// Why the run terminated.
    pub reason: StopReason,
    /// The model's final textual response.
    pub final_response: String,
    /// Tool execution log in dispatch order.
    pub tool_executions: Vec<ToolExecution>,
    /// Number of LLM iterations performed.
    pub iterations: u32,
    /// Cumulative token usage.
    pub tokens_used: TokenUsage,
    /// Wall-clock duration of the run.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Error message for `Error` status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
