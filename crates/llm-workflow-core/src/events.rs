// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed synchronous pub/sub for lifecycle observation.
//!
//! Events for a single run are emitted in causal order on the thread that
//! produced them. Handler errors are collected and logged without
//! interrupting fan-out; handler panics are recovered. The handler list is
//! copied under a short read section before invocation so emission never
//! holds the lock across user code.

use crate::run::{RunStatus, StepStatus, TokenUsage};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Event types emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A run started.
    WorkflowStarted,
    /// A run completed successfully.
    WorkflowCompleted,
    /// A run failed.
    WorkflowFailed,
    /// A step started executing.
    StepStarted,
    /// A step completed successfully.
    StepCompleted,
    /// A step failed.
    StepFailed,
    /// A token delta from a streaming provider.
    LlmToken,
    /// The model requested a tool call.
    LlmToolCall,
    /// A tool call finished.
    LlmToolResult,
    /// An agent loop iteration began.
    AgentIteration,
    /// A tool emitted an output chunk.
    ToolOutput,
    /// Run token usage changed.
    TokenUpdate,
}

impl EventKind {
    /// Dotted wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::StepStarted => "step.started",
            Self::StepCompleted => "step.completed",
            Self::StepFailed => "step.failed",
            Self::LlmToken => "llm.token",
            Self::LlmToolCall => "llm.tool_call",
            Self::LlmToolResult => "llm.tool_result",
            Self::AgentIteration => "agent.iteration",
            Self::ToolOutput => "tool.output",
            Self::TokenUpdate => "token.update",
        }
    }
}

/// Type-specific event payload.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    /// Run lifecycle payload.
    Workflow {
        /// Run id.
        run_id: Uuid,
        /// Run status after the transition.
        status: RunStatus,
        /// Redacted inputs snapshot (started events only).
        #[serde(skip_serializing_if = "Option::is_none")]
        inputs: Option<Value>,
        /// Error message (failed events only).
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Step lifecycle payload.
    Step {
        /// Step status after the transition.
        status: StepStatus,
        /// Step kind name.
        step_type: String,
        /// Duration in milliseconds (terminal events only).
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        /// Error message (failed events only).
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Streaming token delta.
    LlmToken {
        /// Text fragment.
        delta: String,
    },
    /// Tool call requested by the model.
    ToolCall {
        /// Call id.
        call_id: String,
        /// Tool name.
        tool_name: String,
        /// Call arguments.
        arguments: Value,
    },
    /// Tool call finished.
    ToolResult {
        /// Call id.
        call_id: String,
        /// Tool name.
        tool_name: String,
        /// Whether the call succeeded.
        success: bool,
    },
    /// Agent loop iteration.
    AgentIteration {
        /// 1-based iteration number.
        iteration: u32,
        /// Cumulative tokens used by the agent.
        tokens_used: u64,
    },
    /// Tool output chunk.
    ToolOutput {
        /// Call id.
        call_id: String,
        /// Tool name.
        tool_name: String,
        /// Logical stream name.
        stream: String,
        /// Chunk payload.
        data: String,
        /// Whether this was the final chunk.
        is_final: bool,
        /// Opaque chunk metadata.
        metadata: HashMap<String, Value>,
    },
    /// Usage roll-up.
    TokenUpdate {
        /// Run usage totals after the update.
        usage: TokenUsage,
    },
}

/// An engine event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    /// Workflow the event belongs to.
    pub workflow_id: String,
    /// Step the event belongs to, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Type-specific payload.
    pub payload: EventPayload,
}

impl Event {
    /// Creates an event stamped now.
    pub fn new(
        kind: EventKind,
        workflow_id: impl Into<String>,
        step_id: Option<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            workflow_id: workflow_id.into(),
            step_id,
            payload,
        }
    }
}

/// Event handler signature.
pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Fan-out strategy for [`EventBus::emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitMode {
    /// Handlers run one after another on the emitting thread (default,
    /// preserves ordering).
    #[default]
    Sync,
    /// Handlers run concurrently; ordering within a single handler is
    /// still program order.
    Parallel,
}

/// Typed pub/sub bus.
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<EventHandler>>>,
    mode: EmitMode,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with synchronous fan-out.
    pub fn new() -> Self {
        Self::with_mode(EmitMode::Sync)
    }

    /// Creates a bus with the given fan-out mode.
    pub fn with_mode(mode: EmitMode) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            mode,
        }
    }

    /// Registers a handler for an event type.
    pub fn on(&self, kind: EventKind, handler: EventHandler) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Removes all handlers for an event type.
    pub fn off(&self, kind: EventKind) {
        self.handlers.write().remove(&kind);
    }

    /// Removes every handler.
    pub fn remove_all_listeners(&self) {
        self.handlers.write().clear();
    }

    /// Number of handlers registered for an event type.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Emits an event to all handlers of its type.
    ///
    /// A handler error is collected and logged but the bus continues
    /// invoking remaining handlers; panics are recovered.
    pub fn emit(&self, event: &Event) {
        // Copy under a short read section so emission cannot block writers
        // for the duration of handler execution.
        let handlers: Vec<EventHandler> = {
            let guard = self.handlers.read();
            match guard.get(&event.kind) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        match self.mode {
            EmitMode::Sync => {
                for handler in &handlers {
                    Self::invoke(handler, event);
                }
            }
            EmitMode::Parallel => {
                std::thread::scope(|scope| {
                    for handler in &handlers {
                        scope.spawn(move || Self::invoke(handler, event));
                    }
                });
            }
        }
    }

    fn invoke(handler: &EventHandler, event: &Event) {
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(event = event.kind.as_str(), error = %err, "Event handler returned error");
            }
            Err(_) => {
                warn!(event = event.kind.as_str(), "Event handler panicked");
            }
        }
    }

    /// Emits a run state change.
    pub fn emit_run_state(
        &self,
        kind: EventKind,
        workflow_id: &str,
        run_id: Uuid,
        status: RunStatus,
        inputs: Option<Value>,
        error: Option<String>,
    ) {
        self.emit(&Event::new(
            kind,
            workflow_id,
            None,
            EventPayload::Workflow {
                run_id,
                status,
                inputs,
                error,
            },
        ));
    }

    /// Emits a step state change.
    pub fn emit_step_state(
        &self,
        kind: EventKind,
        workflow_id: &str,
        step_id: &str,
        step_type: &str,
        status: StepStatus,
        duration_ms: Option<u64>,
        error: Option<String>,
    ) {
        self.emit(&Event::new(
            kind,
            workflow_id,
            Some(step_id.to_string()),
            EventPayload::Step {
                status,
                step_type: step_type.to_string(),
                duration_ms,
                error,
            },
        ));
    }

    /// Emits a usage roll-up.
    pub fn emit_token_update(&self, workflow_id: &str, step_id: Option<String>, usage: TokenUsage) {
        self.emit(&Event::new(
            EventKind::TokenUpdate,
            workflow_id,
            step_id,
            EventPayload::TokenUpdate { usage },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        Arc::new(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn step_event() -> Event {
        Event::new(
            EventKind::StepStarted,
            "wf",
            Some("s1".to_string()),
            EventPayload::Step {
                status: StepStatus::Running,
                step_type: "llm".to_string(),
                duration_ms: None,
                error: None,
            },
        )
    }

    #[test]
    fn test_on_emit_off() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on(EventKind::StepStarted, counting_handler(counter.clone()));

        bus.emit(&step_event());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::StepStarted), 1);

        bus.off(EventKind::StepStarted);
        bus.emit(&step_event());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::StepStarted), 0);
    }

    #[test]
    fn test_handler_error_does_not_stop_fanout() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));

        bus.on(
            EventKind::StepStarted,
            Arc::new(|_| anyhow::bail!("handler error")),
        );
        bus.on(EventKind::StepStarted, counting_handler(counter.clone()));

        bus.emit(&step_event());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_panic_recovered() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::StepStarted, Arc::new(|_| panic!("boom")));
        bus.on(EventKind::StepStarted, counting_handler(counter.clone()));

        bus.emit(&step_event());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sync_fanout_preserves_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.on(
                EventKind::StepStarted,
                Arc::new(move |_| {
                    order.lock().push(tag);
                    Ok(())
                }),
            );
        }

        bus.emit(&step_event());
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_parallel_fanout_invokes_all() {
        let bus = EventBus::with_mode(EmitMode::Parallel);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            bus.on(EventKind::TokenUpdate, counting_handler(counter.clone()));
        }

        bus.emit_token_update("wf", None, TokenUsage::zero());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_remove_all_listeners() {
        let bus = EventBus::new();
        bus.on(EventKind::StepStarted, Arc::new(|_| Ok(())));
        bus.on(EventKind::StepFailed, Arc::new(|_| Ok(())));
        bus.remove_all_listeners();
        assert_eq!(bus.listener_count(EventKind::StepStarted), 0);
        assert_eq!(bus.listener_count(EventKind::StepFailed), 0);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = step_event();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_started");
        assert_eq!(json["workflow_id"], "wf");
        assert_eq!(json["step_id"], "s1");
        assert_eq!(json["payload"]["step_type"], "llm");
    }
}
