// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run state: statuses, per-step results and token accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::AddAssign;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle status of a run. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// All steps finished and the run produced an output.
    Completed,
    /// A step failure ended the run.
    Failed,
    /// The run was cancelled from outside.
    Cancelled,
}

impl RunStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Execution status for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step is waiting for dependencies.
    Pending,
    /// Step is currently executing.
    Running,
    /// Step completed successfully.
    Success,
    /// Step failed with an error.
    Failed,
    /// Step was skipped due to a condition.
    Skipped,
}

impl StepStatus {
    /// Whether the status is terminal for scheduling purposes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

/// Token counts attributed to a single LLM exchange or step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt-side tokens.
    pub input_tokens: u64,
    /// Completion-side tokens.
    pub output_tokens: u64,
    /// Tokens read from a provider-side cache.
    pub cache_read_tokens: u64,
    /// Tokens written to a provider-side cache.
    pub cache_write_tokens: u64,
    /// Total tokens as reported by the provider.
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Usage with all counters at zero.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Whether every counter is zero.
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cache_read_tokens += rhs.cache_read_tokens;
        self.cache_write_tokens += rhs.cache_write_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

/// Accumulated usage for a run. Totals always equal the sum of the
/// per-step counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    /// Totals across all steps.
    pub totals: TokenUsage,
    /// Per-step token counts keyed by step id.
    pub per_step: HashMap<String, TokenUsage>,
}

impl UsageStats {
    /// Records usage for a step, rolling it into the totals.
    pub fn record_step(&mut self, step_id: &str, usage: TokenUsage) {
        if usage.is_zero() {
            return;
        }
        *self.per_step.entry(step_id.to_string()).or_default() += usage;
        self.totals += usage;
    }
}

/// Result of a step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step id.
    pub step_id: String,
    /// Execution status.
    pub status: StepStatus,
    /// Output values from the step.
    pub output: serde_json::Map<String, serde_json::Value>,
    /// Execution duration in milliseconds.
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub duration: Duration,
    /// Token usage attributed to the step.
    pub tokens: TokenUsage,
    /// Error message if failed.
    pub error: Option<String>,
}

impl StepResult {
    /// A skipped result with empty outputs.
    pub fn skipped(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            output: serde_json::Map::new(),
            duration: Duration::from_secs(0),
            tokens: TokenUsage::zero(),
            error: None,
        }
    }
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// One execution of a workflow with concrete inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique run id.
    pub run_id: Uuid,
    /// Name of the workflow that produced this run.
    pub workflow_id: String,
    /// Lifecycle status.
    pub status: RunStatus,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-step result records.
    pub step_results: HashMap<String, StepResult>,
    /// Accumulated token usage.
    pub usage: UsageStats,
    /// Final workflow output (declared outputs, or the last step's output).
    pub output: serde_json::Map<String, serde_json::Value>,
    /// Error message if the run failed.
    pub error: Option<String>,
}

impl Run {
    /// Creates a pending run for a workflow.
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            step_results: HashMap::new(),
            usage: UsageStats::default(),
            output: serde_json::Map::new(),
            error: None,
        }
    }
}
