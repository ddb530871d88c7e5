// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workflow definition model and shape validation.
//!
//! A workflow is parsed from YAML into [`Workflow`] and validated before
//! execution: unique step ids, resolvable dependencies, sane input
//! declarations and template references that point at declared steps.
//! Cycle detection lives in [`crate::dag`].

use crate::error::{EngineError, Result};
use crate::integration::IntegrationDef;
use crate::template;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// A workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow name; doubles as the workflow id in run records.
    pub name: String,
    /// Definition version string.
    #[serde(default = "default_version")]
    pub version: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared inputs keyed by name.
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDecl>,
    /// Declared outputs: name to template expression.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Named external service bindings.
    #[serde(default)]
    pub integrations: BTreeMap<String, IntegrationDef>,
    /// External requirements of the workflow.
    #[serde(default)]
    pub requires: Requirements,
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Declared workflow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDecl {
    /// Value type.
    #[serde(rename = "type")]
    pub input_type: InputType,
    /// Default value when the caller omits the input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Whether the caller must supply the input.
    #[serde(default)]
    pub required: bool,
}

/// Input value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl InputType {
    /// Whether a JSON value matches this type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// External dependencies declared by a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    /// Integration aliases that must be bound at run time.
    #[serde(default)]
    pub integrations: Vec<String>,
    /// External tool servers the workflow's agents expect.
    #[serde(default)]
    pub tool_servers: Vec<String>,
}

/// A single step within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Stable id, unique within the workflow.
    pub id: String,
    /// Ids of steps that must complete before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Optional guard; when it evaluates false the step is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// Optional retry configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Optional timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Type-specific payload.
    #[serde(flatten)]
    pub kind: StepKind,
}

/// Guard expression attached to a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Boolean template expression.
    pub expression: String,
}

/// Per-step retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, at least 1.
    pub max_attempts: u32,
    /// Base backoff delay in seconds before the second attempt.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    /// Multiplier applied per further attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_backoff_base() -> f64 {
    1.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Type-specific step payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Single language-model call.
    Llm(LlmStep),
    /// Deterministic call against a declared integration.
    Action(ActionStep),
    /// Autonomous agent loop.
    Agent(AgentStep),
    /// Parallel fan-out over nested steps.
    Parallel(ParallelStep),
    /// Conditional branch.
    Condition(ConditionStep),
    /// Delegation to another workflow file.
    SubWorkflow(SubWorkflowStep),
}

impl StepKind {
    /// Short name used in logs and events.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Llm(_) => "llm",
            Self::Action(_) => "action",
            Self::Agent(_) => "agent",
            Self::Parallel(_) => "parallel",
            Self::Condition(_) => "condition",
            Self::SubWorkflow(_) => "sub_workflow",
        }
    }
}

/// LLM step payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmStep {
    /// Provider name; falls back to the engine default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Model identifier.
    pub model: String,
    /// System prompt template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// User prompt template.
    pub prompt: String,
    /// Expected JSON schema of the response, validated when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Names of tools the model may call.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Completion token cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Action step payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStep {
    /// Name of a declared integration.
    pub integration: String,
    /// Operation name within the integration.
    pub operation: String,
    /// Operation inputs; values may be templates.
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
}

/// Agent step payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    /// Provider name; falls back to the engine default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Model identifier.
    pub model: String,
    /// System prompt template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// User prompt template.
    pub prompt: String,
    /// Names of tools the agent may call.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Iteration cap; engine default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Cumulative token limit for the agent (0 = unlimited).
    #[serde(default)]
    pub token_limit: u64,
    /// Terminate the agent when a tool call errors.
    #[serde(default)]
    pub stop_on_tool_error: bool,
}

/// Parallel step payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelStep {
    /// Nested child steps.
    pub steps: Vec<Step>,
    /// Template producing an iterable; each value is bound as `item`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<String>,
    /// Concurrency bound for iterations or children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

/// Condition step payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionStep {
    /// Boolean template expression.
    pub expression: String,
    /// Steps executed when the expression is true.
    #[serde(default, rename = "then")]
    pub then_steps: Vec<Step>,
    /// Steps executed when the expression is false.
    #[serde(default, rename = "else")]
    pub else_steps: Vec<Step>,
}

/// Sub-workflow step payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubWorkflowStep {
    /// Relative path to the referenced workflow file.
    pub workflow: String,
    /// Inputs passed to the sub-workflow; values may be templates.
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
}

impl Workflow {
    /// Parses a workflow from YAML.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| EngineError::Validation(format!("failed to parse workflow YAML: {}", e)))
    }

    /// Validates the workflow shape.
    ///
    /// Checks, in order: unique step ids (including nested steps), resolvable
    /// `depends_on` references, template step references, and input
    /// declaration sanity. Cycle detection is performed separately when the
    /// DAG is built.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation("workflow name is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(EngineError::Validation("workflow has no steps".to_string()));
        }

        // Unique ids across the whole tree: nested outputs share one
        // namespace with top-level steps.
        let mut seen = HashSet::new();
        let mut all_ids = HashSet::new();
        self.walk_steps(&mut |step| {
            if step.id.trim().is_empty() {
                return Err(EngineError::Validation("step with empty id".to_string()));
            }
            if !seen.insert(step.id.clone()) {
                return Err(EngineError::Validation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            all_ids.insert(step.id.clone());
            Ok(())
        })?;

        // Dependencies resolve to another step id.
        self.walk_steps(&mut |step| {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(EngineError::Validation(format!(
                        "step '{}' depends on itself",
                        step.id
                    )));
                }
                if !all_ids.contains(dep) {
                    return Err(EngineError::Validation(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
            if let Some(retry) = &step.retry {
                if retry.max_attempts == 0 {
                    return Err(EngineError::Validation(format!(
                        "step '{}': retry max_attempts must be at least 1",
                        step.id
                    )));
                }
            }
            Ok(())
        })?;

        // Every `steps.X` template reference names a declared step.
        for tmpl in self.collect_templates() {
            for referenced in template::extract_step_refs(&tmpl) {
                if !all_ids.contains(&referenced) {
                    return Err(EngineError::Validation(format!(
                        "template references unknown step '{}'",
                        referenced
                    )));
                }
            }
        }

        Ok(())
    }

    /// Validates caller-supplied inputs against the declarations and fills
    /// in defaults. Returns the effective input map.
    pub fn resolve_inputs(
        &self,
        supplied: HashMap<String, Value>,
    ) -> Result<serde_json::Map<String, Value>> {
        let mut resolved = serde_json::Map::new();

        for (name, decl) in &self.inputs {
            match supplied.get(name) {
                Some(value) => {
                    if !decl.input_type.matches(value) {
                        return Err(EngineError::Validation(format!(
                            "input '{}' has wrong type, expected {:?}",
                            name, decl.input_type
                        )));
                    }
                    resolved.insert(name.clone(), value.clone());
                }
                None => match &decl.default {
                    Some(default) => {
                        resolved.insert(name.clone(), default.clone());
                    }
                    None if decl.required => {
                        return Err(EngineError::Validation(format!(
                            "required input '{}' is missing",
                            name
                        )));
                    }
                    None => {}
                },
            }
        }

        // Undeclared extras pass through untouched.
        for (name, value) in supplied {
            resolved.entry(name).or_insert(value);
        }

        Ok(resolved)
    }

    /// Visits every step in the workflow, including nested parallel and
    /// condition children, in document order.
    pub fn walk_steps<F>(&self, visit: &mut F) -> Result<()>
    where
        F: FnMut(&Step) -> Result<()>,
    {
        fn walk<F>(steps: &[Step], visit: &mut F) -> Result<()>
        where
            F: FnMut(&Step) -> Result<()>,
        {
            for step in steps {
                visit(step)?;
                match &step.kind {
                    StepKind::Parallel(p) => walk(&p.steps, visit)?,
                    StepKind::Condition(c) => {
                        walk(&c.then_steps, visit)?;
                        walk(&c.else_steps, visit)?;
                    }
                    _ => {}
                }
            }
            Ok(())
        }
        walk(&self.steps, visit)
    }

    /// Collects every templated string in the definition: prompts, action
    /// inputs, conditions, `foreach` expressions and declared outputs.
    pub fn collect_templates(&self) -> Vec<String> {
        fn collect_value(value: &Value, out: &mut Vec<String>) {
            match value {
                Value::String(s) => out.push(s.clone()),
                Value::Array(items) => items.iter().for_each(|v| collect_value(v, out)),
                Value::Object(map) => map.values().for_each(|v| collect_value(v, out)),
                _ => {}
            }
        }

        let mut templates = Vec::new();
        let _ = self.walk_steps(&mut |step| {
            if let Some(cond) = &step.condition {
                templates.push(cond.expression.clone());
            }
            match &step.kind {
                StepKind::Llm(llm) => {
                    if let Some(system) = &llm.system {
                        templates.push(system.clone());
                    }
                    templates.push(llm.prompt.clone());
                }
                StepKind::Action(action) => {
                    for value in action.inputs.values() {
                        collect_value(value, &mut templates);
                    }
                }
                StepKind::Agent(agent) => {
                    if let Some(system) = &agent.system {
                        templates.push(system.clone());
                    }
                    templates.push(agent.prompt.clone());
                }
                StepKind::Parallel(p) => {
                    if let Some(foreach) = &p.foreach {
                        templates.push(foreach.clone());
                    }
                }
                StepKind::Condition(c) => templates.push(c.expression.clone()),
                StepKind::SubWorkflow(sub) => {
                    for value in sub.inputs.values() {
                        collect_value(value, &mut templates);
                    }
                }
            }
            Ok(())
        });
        templates.extend(self.outputs.values().cloned());
        templates
    }

    /// Steps of type sub-workflow anywhere in the tree, with their paths.
    pub fn sub_workflow_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        let _ = self.walk_steps(&mut |step| {
            if let StepKind::SubWorkflow(sub) = &step.kind {
                if !sub.workflow.trim().is_empty() {
                    paths.push(sub.workflow.clone());
                }
            }
            Ok(())
        });
        paths
    }
}
