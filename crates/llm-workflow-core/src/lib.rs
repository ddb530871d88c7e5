// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core workflow execution engine for multi-step LLM pipelines.
//!
//! A workflow is a directed acyclic graph of steps: language-model calls,
//! deterministic integration actions, autonomous agent loops, parallel
//! fan-outs, conditional branches and sub-workflow delegations. The engine
//! validates definitions, resolves dependencies, evaluates templated
//! inputs, executes steps with bounded parallelism, enforces token
//! budgets, streams structured events to observers and checkpoints run
//! state so interrupted runs can resume.
//!
//! The crate never names an LLM vendor; concrete adapters implement
//! [`providers::LlmProvider`] and live in the providers crate.

pub mod agent;
pub mod checkpoint;
pub mod context;
pub mod dag;
pub mod error;
pub mod events;
pub mod executor;
pub mod integration;
pub mod providers;
pub mod queue;
pub mod redact;
pub mod retry;
pub mod run;
pub mod subworkflow;
pub mod template;
pub mod tools;
pub mod truncate;
pub mod workflow;

pub use agent::{AgentConfig, AgentResult, AgentRunner, AgentStatus, ContextManager, StopReason};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use dag::WorkflowDag;
pub use error::{EngineError, Result};
pub use events::{EmitMode, Event, EventBus, EventKind, EventPayload};
pub use executor::{ExecutorOptions, WorkflowExecutor};
pub use providers::{ChatRequest, ChatResponse, LlmProvider, Message, ProviderError, Role, ToolCall};
pub use queue::{Job, JobQueue, QueueError};
pub use run::{Run, RunStatus, StepResult, StepStatus, TokenUsage, UsageStats};
pub use subworkflow::{LoadContext, LoaderError, SubWorkflowLoader};
pub use tools::{Tool, ToolChunk, ToolError, ToolRegistry};
pub use truncate::{truncate_code, TruncateError, TruncateOptions, TruncateResult};
pub use workflow::{Step, StepKind, Workflow};
