// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rolling workflow context shared between steps.
//!
//! The context is the JSON object `{inputs, steps}` that templates
//! evaluate against. Only the scheduler writes to it, between step
//! completions; workers receive a frozen snapshot taken at dispatch time.

use crate::run::StepStatus;
use parking_lot::RwLock;
use serde_json::{Map, Value};

/// Mutable workflow context owned by the executor.
#[derive(Debug)]
pub struct ExecutionContext {
    inner: RwLock<Value>,
}

impl ExecutionContext {
    /// Creates a context with the given resolved inputs and no step outputs.
    pub fn new(inputs: Map<String, Value>) -> Self {
        let mut root = Map::new();
        root.insert("inputs".to_string(), Value::Object(inputs));
        root.insert("steps".to_string(), Value::Object(Map::new()));
        Self {
            inner: RwLock::new(Value::Object(root)),
        }
    }

    /// Restores a context from a checkpoint snapshot.
    pub fn from_snapshot(snapshot: Value) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    /// Records a step's output and status under `steps.<id>`.
    ///
    /// Skipped steps are recorded with status only; their outputs stay
    /// absent so template references to them fail loudly.
    pub fn set_step(&self, step_id: &str, output: Option<Map<String, Value>>, status: StepStatus) {
        let mut entry = Map::new();
        entry.insert(
            "status".to_string(),
            serde_json::to_value(status).unwrap_or(Value::Null),
        );
        if let Some(output) = output {
            entry.insert("output".to_string(), Value::Object(output));
        }

        let mut guard = self.inner.write();
        if let Some(steps) = guard.get_mut("steps").and_then(Value::as_object_mut) {
            steps.insert(step_id.to_string(), Value::Object(entry));
        }
    }

    /// A frozen snapshot of the full context.
    pub fn snapshot(&self) -> Value {
        self.inner.read().clone()
    }

    /// A frozen snapshot with `item` bound for a `foreach` iteration.
    pub fn snapshot_with_item(&self, item: &Value) -> Value {
        let mut snapshot = self.snapshot();
        if let Some(map) = snapshot.as_object_mut() {
            map.insert("item".to_string(), item.clone());
        }
        snapshot
    }

    /// The current inputs map.
    pub fn inputs(&self) -> Map<String, Value> {
        self.inner
            .read()
            .get("inputs")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// The current per-step outputs, keyed by step id.
    pub fn step_outputs(&self) -> Map<String, Value> {
        self.inner
            .read()
            .get("steps")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }
}
