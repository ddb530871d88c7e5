// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tool trait and registry.
//!
//! A tool advertises a name, description and input schema to the model and
//! executes with a JSON inputs map. Execution is observed as a bounded
//! stream of [`ToolChunk`]s: exactly one chunk has `is_final == true`, it
//! is the last chunk, and it carries the result map or the runtime error.
//! Startup failures (unknown tool, invalid arguments) are returned before
//! any chunk is produced.

use crate::providers::ToolSpec;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the per-invocation chunk channel.
const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Streaming increment produced by a tool execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolChunk {
    /// Logical stream: `stdout`, `stderr`, or empty.
    #[serde(default)]
    pub stream: String,
    /// Chunk payload.
    #[serde(default)]
    pub data: String,
    /// Whether this is the last chunk.
    #[serde(default)]
    pub is_final: bool,
    /// Final-only result map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
    /// Final-only runtime error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Opaque metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl ToolChunk {
    /// An intermediate data chunk.
    pub fn data(stream: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            data: data.into(),
            ..Default::default()
        }
    }

    /// The final chunk of a successful execution.
    pub fn final_ok(result: Map<String, Value>) -> Self {
        Self {
            is_final: true,
            result: Some(result),
            ..Default::default()
        }
    }

    /// The final chunk of a failed execution.
    pub fn final_err(error: impl Into<String>) -> Self {
        Self {
            is_final: true,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Tool startup errors. Runtime failures are delivered in the final chunk.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    /// No tool registered under the requested name.
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    /// The arguments could not be normalized into an inputs map.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// The tool failed before producing any chunk.
    #[error("tool startup failed: {0}")]
    StartupFailed(String),
}

/// An invocable capability advertised to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON schema of the tool's inputs.
    fn schema(&self) -> Value;

    /// Executes the tool. Runtime failures are reported as `Err(message)`
    /// and surface in the final chunk's `error` field.
    async fn execute(
        &self,
        inputs: Map<String, Value>,
    ) -> std::result::Result<Map<String, Value>, String>;

    /// Whether the tool produces its own chunk stream.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Streams execution chunks. Only called when
    /// [`supports_streaming`](Self::supports_streaming) returns true.
    async fn execute_stream(
        &self,
        _inputs: Map<String, Value>,
        _call_id: &str,
        _cancel: CancellationToken,
    ) -> std::result::Result<mpsc::Receiver<ToolChunk>, ToolError> {
        Err(ToolError::StartupFailed(
            "tool does not implement streaming".to_string(),
        ))
    }
}

/// Registry of tools keyed by name.
///
/// Lookups are read-dominated; registration during execution is allowed
/// but does not affect already-resolved callsites in flight.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool under its own name, replacing any previous entry.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Looks up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|entry| entry.value().clone())
    }

    /// Registered tool names.
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Specs for the named tools, in the order given. Unknown names are
    /// silently dropped; the model only sees what exists.
    pub fn specs_for(&self, allowed: &[String]) -> Vec<ToolSpec> {
        allowed
            .iter()
            .filter_map(|name| self.get(name))
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                schema: tool.schema(),
            })
            .collect()
    }

    /// A registry restricted to the named tools.
    pub fn filtered(&self, allowed: &[String]) -> ToolRegistry {
        let registry = ToolRegistry::new();
        for name in allowed {
            if let Some(tool) = self.get(name) {
                registry.register(tool);
            }
        }
        registry
    }

    /// Starts a tool execution and returns its chunk stream.
    ///
    /// Tools that do not stream natively are wrapped: their `execute`
    /// result becomes a single final chunk. Exactly one chunk on the
    /// returned channel has `is_final == true`, and it is the last one.
    pub async fn execute_stream(
        &self,
        name: &str,
        inputs: Map<String, Value>,
        call_id: &str,
        cancel: CancellationToken,
    ) -> std::result::Result<mpsc::Receiver<ToolChunk>, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        if tool.supports_streaming() {
            return tool.execute_stream(inputs, call_id, cancel).await;
        }

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => ToolChunk::final_err("cancelled"),
                result = tool.execute(inputs) => match result {
                    Ok(outputs) => ToolChunk::final_ok(outputs),
                    Err(message) => ToolChunk::final_err(message),
                },
            };
            // Receiver may be gone if the caller bailed; nothing to do.
            let _ = tx.send(chunk).await;
        });
        Ok(rx)
    }
}
