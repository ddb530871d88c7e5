// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workflow execution engine with async Tokio runtime.
//!
//! The executor owns a run: it validates the definition, resolves
//! dependencies into a DAG, dispatches ready steps into workers up to the
//! configured parallelism, merges outputs back into the rolling context,
//! enforces the token budget, snapshots checkpoints at step boundaries and
//! emits lifecycle events.
//!
//! The scheduler thread is the only writer of the workflow context;
//! workers execute against a frozen snapshot taken at dispatch time.

use crate::agent::{AgentConfig, AgentRunner, AgentStatus, DEFAULT_MAX_ITERATIONS};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::context::ExecutionContext;
use crate::dag::WorkflowDag;
use crate::error::{EngineError, Result};
use crate::events::{EventBus, EventKind};
use crate::integration::IntegrationClient;
use crate::providers::{ChatRequest, LlmProvider, Message};
use crate::redact::redact_value;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::run::{Run, RunStatus, StepResult, StepStatus, TokenUsage};
use crate::subworkflow::{LoadContext, SubWorkflowLoader};
use crate::template::TemplateEngine;
use crate::tools::ToolRegistry;
use crate::workflow::{
    ActionStep, AgentStep, ConditionStep, LlmStep, ParallelStep, Step, StepKind, SubWorkflowStep,
    Workflow,
};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Options for a single run.
#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    /// Per-run cumulative token limit (0 = unlimited).
    pub token_limit: u64,
    /// Integration name to secret.
    pub credentials: HashMap<String, String>,
    /// External tool servers the run may use. Checked against the
    /// workflow's requirements before execution.
    pub allowed_tool_servers: Vec<String>,
    /// Concurrent top-level steps (0 or 1 = sequential).
    pub max_parallel_steps: usize,
    /// Provider used when a step names none.
    pub default_provider: Option<String>,
    /// Directory sub-workflow references resolve under.
    pub workflow_dir: Option<PathBuf>,
}

/// Outcome of one step worker.
struct StepOutcome {
    output: Map<String, Value>,
    tokens: TokenUsage,
    skipped: bool,
    duration: Duration,
    child_results: Vec<ChildResult>,
}

impl StepOutcome {
    fn skipped() -> Self {
        Self {
            output: Map::new(),
            tokens: TokenUsage::zero(),
            skipped: true,
            duration: Duration::ZERO,
            child_results: Vec::new(),
        }
    }
}

/// Result of a nested child step, surfaced so the scheduler can record it.
struct ChildResult {
    step_id: String,
    status: StepStatus,
    output: Map<String, Value>,
}

/// Workflow execution engine.
#[derive(Clone)]
pub struct WorkflowExecutor {
    providers: Arc<DashMap<String, Arc<dyn LlmProvider>>>,
    tools: Arc<ToolRegistry>,
    events: Arc<EventBus>,
    loader: Arc<SubWorkflowLoader>,
    checkpoints: Arc<CheckpointStore>,
    integrations: Arc<IntegrationClient>,
    engine: Arc<TemplateEngine>,
}

impl Default for WorkflowExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowExecutor {
    /// Creates an executor with no providers, tools or persistence.
    pub fn new() -> Self {
        Self {
            providers: Arc::new(DashMap::new()),
            tools: Arc::new(ToolRegistry::new()),
            events: Arc::new(EventBus::new()),
            loader: Arc::new(SubWorkflowLoader::new()),
            checkpoints: Arc::new(CheckpointStore::disabled()),
            integrations: Arc::new(IntegrationClient::new()),
            engine: Arc::new(TemplateEngine::new()),
        }
    }

    /// Registers an LLM provider.
    pub fn with_provider(self, name: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    /// Uses the given tool registry.
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    /// Uses the given event bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Uses the given checkpoint store.
    pub fn with_checkpoints(mut self, checkpoints: Arc<CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// The executor's event bus.
    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// The executor's tool registry.
    pub fn tools(&self) -> Arc<ToolRegistry> {
        self.tools.clone()
    }

    /// Executes a workflow against an input map.
    ///
    /// Validation failures abort before any step runs and surface as
    /// `Err`. Step failures are reported in the returned [`Run`].
    pub async fn run(
        &self,
        cancel: CancellationToken,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
        options: &ExecutorOptions,
    ) -> Result<Run> {
        // Pre-execution validation, in order: shape, cycles, requirements,
        // inputs, transitive sub-workflow references.
        workflow.validate()?;
        let dag = WorkflowDag::from_workflow(workflow)?;
        self.check_requirements(workflow, options)?;
        let resolved_inputs = workflow.resolve_inputs(inputs)?;
        self.preload_sub_workflows(workflow, options)?;

        let workflow = Arc::new(workflow.clone());
        let options = Arc::new(options.clone());

        let mut run = Run::new(workflow.name.clone());
        run.status = RunStatus::Running;
        let context = Arc::new(ExecutionContext::new(resolved_inputs));

        info!(
            workflow = %workflow.name,
            run_id = %run.run_id,
            steps = workflow.steps.len(),
            "Starting workflow run"
        );
        self.events.emit_run_state(
            EventKind::WorkflowStarted,
            &workflow.name,
            run.run_id,
            RunStatus::Running,
            Some(redact_value(&Value::Object(context.inputs()))),
            None,
        );

        let outcome = self
            .schedule(&mut run, &workflow, &dag, &context, &options, &cancel)
            .await;

        run.completed_at = Some(Utc::now());
        match outcome {
            Ok(()) if cancel.is_cancelled() => {
                run.status = RunStatus::Cancelled;
                run.error = Some("cancelled".to_string());
            }
            Ok(()) => match self.final_output(&workflow, &context, &run) {
                Ok(output) => {
                    run.status = RunStatus::Completed;
                    run.output = output;
                }
                Err(err) => {
                    run.status = RunStatus::Failed;
                    run.error = Some(err.to_string());
                }
            },
            Err(EngineError::Cancelled) => {
                run.status = RunStatus::Cancelled;
                run.error = Some("cancelled".to_string());
            }
            Err(err) => {
                run.status = RunStatus::Failed;
                run.error = Some(err.to_string());
            }
        }

        match run.status {
            RunStatus::Completed => {
                info!(run_id = %run.run_id, "Workflow run completed");
                if let Err(e) = self.checkpoints.delete(run.run_id) {
                    warn!(run_id = %run.run_id, error = %e, "Failed to delete checkpoint");
                }
                self.events.emit_run_state(
                    EventKind::WorkflowCompleted,
                    &workflow.name,
                    run.run_id,
                    run.status,
                    None,
                    None,
                );
            }
            _ => {
                error!(run_id = %run.run_id, status = ?run.status, error = ?run.error, "Workflow run did not complete");
                self.events.emit_run_state(
                    EventKind::WorkflowFailed,
                    &workflow.name,
                    run.run_id,
                    run.status,
                    None,
                    run.error.clone(),
                );
            }
        }

        Ok(run)
    }

    /// Ready-set scheduling loop. Returns `Err` with the first failure.
    async fn schedule(
        &self,
        run: &mut Run,
        workflow: &Arc<Workflow>,
        dag: &WorkflowDag,
        context: &Arc<ExecutionContext>,
        options: &Arc<ExecutorOptions>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let step_cancel = cancel.child_token();
        let parallelism = options.max_parallel_steps.max(1);

        let mut statuses: HashMap<String, StepStatus> = workflow
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepStatus::Pending))
            .collect();
        let index_of: HashMap<String, usize> = workflow
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        let mut join_set: JoinSet<(String, Result<StepOutcome>)> = JoinSet::new();
        let mut in_flight = 0usize;
        let mut unfinished = workflow.steps.len();
        let mut first_error: Option<EngineError> = None;

        while unfinished > 0 {
            // Dispatch every ready step, bounded by the worker pool.
            if first_error.is_none() && !step_cancel.is_cancelled() {
                for step in workflow.steps.iter() {
                    if in_flight >= parallelism {
                        break;
                    }
                    if statuses[&step.id] != StepStatus::Pending {
                        continue;
                    }
                    let deps_ready = dag.dependencies(&step.id).iter().all(|dep| {
                        matches!(
                            statuses.get(dep),
                            Some(StepStatus::Success) | Some(StepStatus::Skipped)
                        )
                    });
                    if !deps_ready {
                        continue;
                    }

                    // Guard condition, evaluated on the scheduler thread
                    // against the current context.
                    if let Some(condition) = &step.condition {
                        match self
                            .engine
                            .evaluate_bool(&condition.expression, &context.snapshot())
                        {
                            Ok(true) => {}
                            Ok(false) => {
                                info!(step_id = %step.id, "Skipping step, condition is false");
                                statuses.insert(step.id.clone(), StepStatus::Skipped);
                                context.set_step(&step.id, None, StepStatus::Skipped);
                                run.step_results
                                    .insert(step.id.clone(), StepResult::skipped(&step.id));
                                self.events.emit_step_state(
                                    EventKind::StepCompleted,
                                    &workflow.name,
                                    &step.id,
                                    step.kind.name(),
                                    StepStatus::Skipped,
                                    Some(0),
                                    None,
                                );
                                unfinished -= 1;
                                continue;
                            }
                            Err(err) => {
                                statuses.insert(step.id.clone(), StepStatus::Failed);
                                unfinished -= 1;
                                first_error =
                                    Some(EngineError::for_step(step.id.clone(), err));
                                step_cancel.cancel();
                                break;
                            }
                        }
                    }

                    statuses.insert(step.id.clone(), StepStatus::Running);
                    self.events.emit_step_state(
                        EventKind::StepStarted,
                        &workflow.name,
                        &step.id,
                        step.kind.name(),
                        StepStatus::Running,
                        None,
                        None,
                    );

                    let executor = self.clone();
                    let step = step.clone();
                    let workflow = workflow.clone();
                    let options = options.clone();
                    let snapshot = context.snapshot();
                    let cancel = step_cancel.clone();
                    let budget_remaining = remaining_budget(options.token_limit, &run.usage);

                    in_flight += 1;
                    join_set.spawn(async move {
                        let id = step.id.clone();
                        let result = executor
                            .execute_step(&step, &workflow, snapshot, &options, cancel, budget_remaining)
                            .await;
                        (id, result)
                    });
                }
            }

            if in_flight == 0 {
                // Nothing running and nothing dispatchable: either a
                // failure/cancellation stopped dispatch, or we are done.
                break;
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            in_flight -= 1;
            unfinished -= 1;

            let (step_id, result) = joined
                .map_err(|e| EngineError::other(format!("step worker panicked: {}", e)))?;

            match result {
                Ok(outcome) => {
                    self.record_success(run, workflow, context, &mut statuses, &step_id, outcome);

                    // Budget check after the completed step; in-flight
                    // peers are cancelled.
                    if options.token_limit > 0
                        && run.usage.totals.total_tokens > options.token_limit
                    {
                        first_error = Some(EngineError::TokenLimitExceeded {
                            limit: options.token_limit,
                            actual: run.usage.totals.total_tokens,
                        });
                        step_cancel.cancel();
                    }

                    self.save_checkpoint(run, workflow, context, &index_of, &step_id);
                }
                Err(err) => {
                    let was_cancelled = matches!(err, EngineError::Cancelled);
                    statuses.insert(step_id.clone(), StepStatus::Failed);
                    context.set_step(&step_id, None, StepStatus::Failed);
                    run.step_results.insert(
                        step_id.clone(),
                        StepResult {
                            step_id: step_id.clone(),
                            status: StepStatus::Failed,
                            output: Map::new(),
                            duration: Duration::ZERO,
                            tokens: TokenUsage::zero(),
                            error: Some(err.to_string()),
                        },
                    );
                    self.events.emit_step_state(
                        EventKind::StepFailed,
                        &workflow.name,
                        &step_id,
                        step_kind_name(workflow, &step_id),
                        StepStatus::Failed,
                        None,
                        Some(err.safe_message()),
                    );

                    if first_error.is_none() && !(was_cancelled && cancel.is_cancelled()) {
                        first_error = Some(match err {
                            err @ EngineError::Step { .. } => err,
                            err => EngineError::for_step(step_id.clone(), err),
                        });
                    }
                    step_cancel.cancel();

                    self.save_checkpoint(run, workflow, context, &index_of, &step_id);
                }
            }
        }

        // Drain any stragglers so their partial results are recorded.
        while let Some(joined) = join_set.join_next().await {
            if let Ok((step_id, result)) = joined {
                match result {
                    Ok(outcome) => {
                        self.record_success(run, workflow, context, &mut statuses, &step_id, outcome)
                    }
                    Err(err) => {
                        statuses.insert(step_id.clone(), StepStatus::Failed);
                        run.step_results.insert(
                            step_id.clone(),
                            StepResult {
                                step_id: step_id.clone(),
                                status: StepStatus::Failed,
                                output: Map::new(),
                                duration: Duration::ZERO,
                                tokens: TokenUsage::zero(),
                                error: Some(err.to_string()),
                            },
                        );
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record_success(
        &self,
        run: &mut Run,
        workflow: &Arc<Workflow>,
        context: &Arc<ExecutionContext>,
        statuses: &mut HashMap<String, StepStatus>,
        step_id: &str,
        outcome: StepOutcome,
    ) {
        let status = if outcome.skipped {
            StepStatus::Skipped
        } else {
            StepStatus::Success
        };
        statuses.insert(step_id.to_string(), status);

        // Nested children first so the parent's entry wins on conflicts.
        for child in &outcome.child_results {
            context.set_step(
                &child.step_id,
                (child.status == StepStatus::Success).then(|| child.output.clone()),
                child.status,
            );
            run.step_results.insert(
                child.step_id.clone(),
                StepResult {
                    step_id: child.step_id.clone(),
                    status: child.status,
                    output: child.output.clone(),
                    duration: Duration::ZERO,
                    tokens: TokenUsage::zero(),
                    error: None,
                },
            );
        }

        context.set_step(
            step_id,
            (!outcome.skipped).then(|| outcome.output.clone()),
            status,
        );
        run.usage.record_step(step_id, outcome.tokens);
        run.step_results.insert(
            step_id.to_string(),
            StepResult {
                step_id: step_id.to_string(),
                status,
                output: outcome.output,
                duration: outcome.duration,
                tokens: outcome.tokens,
                error: None,
            },
        );

        self.events.emit_step_state(
            EventKind::StepCompleted,
            &workflow.name,
            step_id,
            step_kind_name(workflow, step_id),
            status,
            Some(outcome.duration.as_millis() as u64),
            None,
        );
        if !outcome.tokens.is_zero() {
            self.events
                .emit_token_update(&workflow.name, Some(step_id.to_string()), run.usage.totals);
        }
    }

    /// Best-effort checkpoint at a step boundary.
    fn save_checkpoint(
        &self,
        run: &Run,
        workflow: &Arc<Workflow>,
        context: &Arc<ExecutionContext>,
        index_of: &HashMap<String, usize>,
        step_id: &str,
    ) {
        if !self.checkpoints.is_enabled() {
            return;
        }
        let step_outputs = run
            .step_results
            .iter()
            .filter(|(_, r)| r.status == StepStatus::Success)
            .map(|(id, r)| (id.clone(), Value::Object(r.output.clone())))
            .collect();
        let checkpoint = Checkpoint {
            run_id: run.run_id,
            workflow_id: workflow.name.clone(),
            step_id: step_id.to_string(),
            step_index: index_of.get(step_id).copied().unwrap_or(0),
            context: context.snapshot(),
            step_outputs,
            created_at: Utc::now(),
        };
        if let Err(e) = self.checkpoints.save(&checkpoint) {
            warn!(run_id = %run.run_id, error = %e, "Checkpoint save failed");
        }
    }

    /// Runs one step with its retry and timeout configuration.
    async fn execute_step(
        &self,
        step: &Step,
        workflow: &Arc<Workflow>,
        snapshot: Value,
        options: &Arc<ExecutorOptions>,
        cancel: CancellationToken,
        budget_remaining: u64,
    ) -> Result<StepOutcome> {
        debug!(step_id = %step.id, step_type = step.kind.name(), "Executing step");

        let policy = step
            .retry
            .as_ref()
            .map(RetryPolicy::from_config)
            .unwrap_or_default();
        let step_timeout = step.timeout.map(Duration::from_secs);
        let started = Instant::now();

        let mut outcome = RetryExecutor::new(policy)
            .execute(|| {
                let snapshot = snapshot.clone();
                let cancel = cancel.clone();
                async move {
                    let fut = self.execute_step_inner(
                        step,
                        workflow,
                        snapshot,
                        options,
                        cancel.clone(),
                        budget_remaining,
                    );
                    match step_timeout {
                        Some(limit) => match timeout(limit, fut).await {
                            Ok(result) => result,
                            Err(_) => Err(EngineError::Timeout(limit)),
                        },
                        None => fut.await,
                    }
                }
            })
            .await?;

        outcome.duration = started.elapsed();
        Ok(outcome)
    }

    /// Dispatch table over the step kinds. Boxed because parallel,
    /// condition and sub-workflow steps recurse.
    fn execute_step_inner<'a>(
        &'a self,
        step: &'a Step,
        workflow: &'a Arc<Workflow>,
        snapshot: Value,
        options: &'a Arc<ExecutorOptions>,
        cancel: CancellationToken,
        budget_remaining: u64,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome>> + Send + 'a>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match &step.kind {
                StepKind::Llm(llm) => {
                    self.execute_llm_step(step, llm, snapshot, options, cancel).await
                }
                StepKind::Action(action) => {
                    self.execute_action_step(action, workflow, snapshot, options).await
                }
                StepKind::Agent(agent) => {
                    self.execute_agent_step(step, agent, workflow, snapshot, options, cancel)
                        .await
                }
                StepKind::Parallel(parallel) => {
                    self.execute_parallel_step(
                        parallel, workflow, snapshot, options, cancel, budget_remaining,
                    )
                    .await
                }
                StepKind::Condition(condition) => {
                    self.execute_condition_step(
                        condition, workflow, snapshot, options, cancel, budget_remaining,
                    )
                    .await
                }
                StepKind::SubWorkflow(sub) => {
                    self.execute_sub_workflow_step(sub, snapshot, options, cancel, budget_remaining)
                        .await
                }
            }
            .map_err(|err| match err {
                err @ EngineError::Cancelled => err,
                err @ EngineError::Step { .. } => err,
                err => EngineError::for_step(step.id.clone(), err),
            })
        })
    }

    async fn execute_llm_step(
        &self,
        step: &Step,
        llm: &LlmStep,
        snapshot: Value,
        options: &Arc<ExecutorOptions>,
        cancel: CancellationToken,
    ) -> Result<StepOutcome> {
        let provider = self.provider_for(llm.provider.as_deref(), options)?;

        let mut messages = Vec::new();
        if let Some(system) = &llm.system {
            messages.push(Message::system(self.engine.render(system, &snapshot)?));
        }
        messages.push(Message::user(self.engine.render(&llm.prompt, &snapshot)?));

        let request = ChatRequest {
            model: llm.model.clone(),
            messages,
            tools: self.tools.specs_for(&llm.tools),
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
        };

        debug!(step_id = %step.id, model = %llm.model, "Calling LLM provider");
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            response = provider.complete(request) => response.map_err(EngineError::Provider)?,
        };

        let mut output = Map::new();
        let parsed: Value = match &llm.output_schema {
            Some(schema) => {
                let value: Value = serde_json::from_str(response.content.trim()).map_err(|e| {
                    EngineError::Schema(format!("response is not valid JSON: {}", e))
                })?;
                let validator = jsonschema::validator_for(schema)
                    .map_err(|e| EngineError::Schema(format!("bad output_schema: {}", e)))?;
                validator
                    .validate(&value)
                    .map_err(|e| EngineError::Schema(e.to_string()))?;
                value
            }
            None => Value::String(response.content.clone()),
        };
        output.insert("response".to_string(), parsed);
        output.insert("raw".to_string(), Value::String(response.content.clone()));
        output.insert(
            "tokens".to_string(),
            serde_json::to_value(response.usage).unwrap_or(Value::Null),
        );

        Ok(StepOutcome {
            output,
            tokens: response.usage,
            skipped: false,
            duration: Duration::ZERO,
            child_results: Vec::new(),
        })
    }

    async fn execute_action_step(
        &self,
        action: &ActionStep,
        workflow: &Arc<Workflow>,
        snapshot: Value,
        options: &Arc<ExecutorOptions>,
    ) -> Result<StepOutcome> {
        let def = workflow
            .integrations
            .get(&action.integration)
            .ok_or_else(|| {
                crate::integration::IntegrationError::UnknownIntegration(
                    action.integration.clone(),
                )
            })?;

        let operation = self.engine.render(&action.operation, &snapshot)?;
        let rendered = self
            .engine
            .evaluate_map(&Value::Object(action.inputs.clone().into_iter().collect()), &snapshot)?;
        let inputs = match rendered {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let credential = options.credentials.get(&action.integration).map(String::as_str);
        let body = self
            .integrations
            .execute(&action.integration, def, &operation, inputs, credential)
            .await?;

        let output = match body {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("body".to_string(), other);
                map
            }
        };

        Ok(StepOutcome {
            output,
            tokens: TokenUsage::zero(),
            skipped: false,
            duration: Duration::ZERO,
            child_results: Vec::new(),
        })
    }

    async fn execute_agent_step(
        &self,
        step: &Step,
        agent: &AgentStep,
        workflow: &Arc<Workflow>,
        snapshot: Value,
        options: &Arc<ExecutorOptions>,
        cancel: CancellationToken,
    ) -> Result<StepOutcome> {
        let provider = self.provider_for(agent.provider.as_deref(), options)?;

        let system = match &agent.system {
            Some(system) => self.engine.render(system, &snapshot)?,
            None => String::new(),
        };
        let prompt = self.engine.render(&agent.prompt, &snapshot)?;

        let events = self.events.clone();
        let sink: crate::agent::EventSink = Arc::new(move |event| events.emit(event));

        let runner = AgentRunner::new(
            provider,
            Arc::new(self.tools.filtered(&agent.tools)),
            agent.model.clone(),
        )
        .with_allowed_tools(agent.tools.clone())
        .with_config(AgentConfig {
            max_iterations: agent.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
            token_limit: agent.token_limit,
            stop_on_error: agent.stop_on_tool_error,
            ..AgentConfig::default()
        })
        .with_events(sink)
        .with_event_scope(workflow.name.clone(), Some(step.id.clone()))
        .with_cancellation(cancel);

        let result = runner.run(&system, &prompt).await?;

        if result.status == AgentStatus::Error {
            return Err(EngineError::other(
                result
                    .error
                    .unwrap_or_else(|| "agent run failed".to_string()),
            ));
        }

        let mut output = Map::new();
        output.insert(
            "final_response".to_string(),
            Value::String(result.final_response.clone()),
        );
        output.insert("iterations".to_string(), Value::from(result.iterations));
        output.insert(
            "tool_executions".to_string(),
            serde_json::to_value(&result.tool_executions).unwrap_or(Value::Null),
        );
        output.insert(
            "tokens".to_string(),
            serde_json::to_value(result.tokens_used).unwrap_or(Value::Null),
        );

        Ok(StepOutcome {
            output,
            tokens: result.tokens_used,
            skipped: false,
            duration: Duration::ZERO,
            child_results: Vec::new(),
        })
    }

    async fn execute_parallel_step(
        &self,
        parallel: &ParallelStep,
        workflow: &Arc<Workflow>,
        snapshot: Value,
        options: &Arc<ExecutorOptions>,
        cancel: CancellationToken,
        budget_remaining: u64,
    ) -> Result<StepOutcome> {
        match &parallel.foreach {
            Some(foreach) => {
                let items = self.engine.evaluate_iterable(foreach, &snapshot)?;
                let bound = parallel.max_concurrency.unwrap_or(items.len().max(1)).max(1);
                let semaphore = Arc::new(Semaphore::new(bound));

                let mut handles = Vec::with_capacity(items.len());
                for item in items {
                    let mut iteration_snapshot = snapshot.clone();
                    if let Some(map) = iteration_snapshot.as_object_mut() {
                        map.insert("item".to_string(), item);
                    }
                    let semaphore = semaphore.clone();
                    let executor = self.clone();
                    let steps = parallel.steps.clone();
                    let workflow = workflow.clone();
                    let options = options.clone();
                    let cancel = cancel.clone();

                    handles.push(tokio::spawn(async move {
                        let _permit = semaphore
                            .acquire_owned()
                            .await
                            .map_err(|_| EngineError::Cancelled)?;
                        executor
                            .execute_nested(&steps, &workflow, iteration_snapshot, &options, cancel, budget_remaining)
                            .await
                    }));
                }

                let mut results = Vec::with_capacity(handles.len());
                let mut tokens = TokenUsage::zero();
                for joined in futures::future::join_all(handles).await {
                    let (outputs, _children, iteration_tokens) = joined
                        .map_err(|e| EngineError::other(format!("iteration panicked: {}", e)))??;
                    tokens += iteration_tokens;
                    results.push(Value::Object(outputs));
                }

                let mut output = Map::new();
                output.insert("results".to_string(), Value::Array(results));
                Ok(StepOutcome {
                    output,
                    tokens,
                    skipped: false,
                    duration: Duration::ZERO,
                    child_results: Vec::new(),
                })
            }
            None => {
                // No iterator: all children run concurrently against the
                // same frozen snapshot.
                let mut join = Vec::with_capacity(parallel.steps.len());
                for child in &parallel.steps {
                    let executor = self.clone();
                    let child = child.clone();
                    let workflow = workflow.clone();
                    let snapshot = snapshot.clone();
                    let options = options.clone();
                    let cancel = cancel.clone();
                    join.push(tokio::spawn(async move {
                        let id = child.id.clone();
                        let result = executor
                            .execute_step_inner(&child, &workflow, snapshot, &options, cancel, budget_remaining)
                            .await;
                        (id, result)
                    }));
                }

                let mut output = Map::new();
                let mut tokens = TokenUsage::zero();
                let mut child_results = Vec::new();
                let mut first_error = None;
                for handle in join {
                    let (id, result) = handle
                        .await
                        .map_err(|e| EngineError::other(format!("child panicked: {}", e)))?;
                    match result {
                        Ok(outcome) => {
                            tokens += outcome.tokens;
                            let status = if outcome.skipped {
                                StepStatus::Skipped
                            } else {
                                StepStatus::Success
                            };
                            output.insert(id.clone(), Value::Object(outcome.output.clone()));
                            child_results.push(ChildResult {
                                step_id: id,
                                status,
                                output: outcome.output,
                            });
                            child_results.extend(outcome.child_results);
                        }
                        Err(err) => {
                            if first_error.is_none() {
                                first_error = Some(err);
                            }
                        }
                    }
                }
                if let Some(err) = first_error {
                    return Err(err);
                }

                Ok(StepOutcome {
                    output,
                    tokens,
                    skipped: false,
                    duration: Duration::ZERO,
                    child_results,
                })
            }
        }
    }

    async fn execute_condition_step(
        &self,
        condition: &ConditionStep,
        workflow: &Arc<Workflow>,
        snapshot: Value,
        options: &Arc<ExecutorOptions>,
        cancel: CancellationToken,
        budget_remaining: u64,
    ) -> Result<StepOutcome> {
        let branch = if self.engine.evaluate_bool(&condition.expression, &snapshot)? {
            &condition.then_steps
        } else {
            &condition.else_steps
        };

        if branch.is_empty() {
            return Ok(StepOutcome::skipped());
        }

        let (outputs, child_results, tokens) = self
            .execute_nested(branch, workflow, snapshot, options, cancel, budget_remaining)
            .await?;

        Ok(StepOutcome {
            output: outputs,
            tokens,
            skipped: false,
            duration: Duration::ZERO,
            child_results,
        })
    }

    async fn execute_sub_workflow_step(
        &self,
        sub: &SubWorkflowStep,
        snapshot: Value,
        options: &Arc<ExecutorOptions>,
        cancel: CancellationToken,
        budget_remaining: u64,
    ) -> Result<StepOutcome> {
        let dir = options.workflow_dir.as_ref().ok_or_else(|| {
            EngineError::Validation(
                "sub-workflow steps require a workflow directory".to_string(),
            )
        })?;

        let child = self.loader.load(dir, &sub.workflow, &LoadContext::root())?;

        let rendered = self
            .engine
            .evaluate_map(&Value::Object(sub.inputs.clone().into_iter().collect()), &snapshot)?;
        let inputs: HashMap<String, Value> = match rendered {
            Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        };

        let mut child_options = (**options).clone();
        child_options.token_limit = budget_remaining;
        child_options.workflow_dir = dir
            .join(&sub.workflow)
            .parent()
            .map(|p| p.to_path_buf())
            .or_else(|| Some(dir.clone()));

        let child_run = self
            .run(cancel.child_token(), &child, inputs, &child_options)
            .await?;

        match child_run.status {
            RunStatus::Completed => Ok(StepOutcome {
                output: child_run.output,
                tokens: child_run.usage.totals,
                skipped: false,
                duration: Duration::ZERO,
                child_results: Vec::new(),
            }),
            RunStatus::Cancelled => Err(EngineError::Cancelled),
            _ => Err(EngineError::other(
                child_run
                    .error
                    .unwrap_or_else(|| "sub-workflow failed".to_string()),
            )),
        }
    }

    /// Executes nested steps sequentially in document order against a
    /// local context that accumulates their outputs.
    async fn execute_nested(
        &self,
        steps: &[Step],
        workflow: &Arc<Workflow>,
        mut local_snapshot: Value,
        options: &Arc<ExecutorOptions>,
        cancel: CancellationToken,
        budget_remaining: u64,
    ) -> Result<(Map<String, Value>, Vec<ChildResult>, TokenUsage)> {
        let mut outputs = Map::new();
        let mut child_results = Vec::new();
        let mut tokens = TokenUsage::zero();

        for child in steps {
            if let Some(condition) = &child.condition {
                if !self.engine.evaluate_bool(&condition.expression, &local_snapshot)? {
                    child_results.push(ChildResult {
                        step_id: child.id.clone(),
                        status: StepStatus::Skipped,
                        output: Map::new(),
                    });
                    set_snapshot_step(&mut local_snapshot, &child.id, None, StepStatus::Skipped);
                    continue;
                }
            }

            let outcome = self
                .execute_step_inner(
                    child,
                    workflow,
                    local_snapshot.clone(),
                    options,
                    cancel.clone(),
                    budget_remaining,
                )
                .await?;

            tokens += outcome.tokens;
            let status = if outcome.skipped {
                StepStatus::Skipped
            } else {
                StepStatus::Success
            };
            set_snapshot_step(
                &mut local_snapshot,
                &child.id,
                (!outcome.skipped).then(|| outcome.output.clone()),
                status,
            );
            outputs.insert(child.id.clone(), Value::Object(outcome.output.clone()));
            child_results.push(ChildResult {
                step_id: child.id.clone(),
                status,
                output: outcome.output,
            });
            child_results.extend(outcome.child_results);
        }

        Ok((outputs, child_results, tokens))
    }

    fn provider_for(
        &self,
        step_provider: Option<&str>,
        options: &Arc<ExecutorOptions>,
    ) -> Result<Arc<dyn LlmProvider>> {
        let name = step_provider.or(options.default_provider.as_deref());
        match name {
            Some(name) => self
                .providers
                .get(name)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| EngineError::other(format!("provider '{}' not registered", name))),
            None => {
                // A single registered provider is an unambiguous default.
                if self.providers.len() == 1 {
                    Ok(self
                        .providers
                        .iter()
                        .next()
                        .map(|entry| entry.value().clone())
                        .expect("len checked"))
                } else {
                    Err(EngineError::other(
                        "no provider named and no unambiguous default",
                    ))
                }
            }
        }
    }

    fn check_requirements(&self, workflow: &Workflow, options: &ExecutorOptions) -> Result<()> {
        for alias in &workflow.requires.integrations {
            if !workflow.integrations.contains_key(alias)
                && !options.credentials.contains_key(alias)
            {
                return Err(EngineError::Validation(format!(
                    "required integration '{}' is not bound",
                    alias
                )));
            }
        }
        for server in &workflow.requires.tool_servers {
            if !options.allowed_tool_servers.iter().any(|s| s == server) {
                return Err(EngineError::Validation(format!(
                    "required tool server '{}' is not in the allow-list",
                    server
                )));
            }
        }
        Ok(())
    }

    fn preload_sub_workflows(&self, workflow: &Workflow, options: &ExecutorOptions) -> Result<()> {
        let paths = workflow.sub_workflow_paths();
        if paths.is_empty() {
            return Ok(());
        }
        let dir = options.workflow_dir.as_ref().ok_or_else(|| {
            EngineError::Validation("sub-workflow steps require a workflow directory".to_string())
        })?;
        for path in paths {
            self.loader.load(dir, &path, &LoadContext::root())?;
        }
        Ok(())
    }

    /// Declared outputs, or the last step's output in document order.
    fn final_output(
        &self,
        workflow: &Arc<Workflow>,
        context: &Arc<ExecutionContext>,
        run: &Run,
    ) -> Result<Map<String, Value>> {
        if !workflow.outputs.is_empty() {
            let snapshot = context.snapshot();
            let mut output = Map::new();
            for (name, template) in &workflow.outputs {
                output.insert(name.clone(), self.engine.evaluate_value(template, &snapshot)?);
            }
            return Ok(output);
        }

        Ok(workflow
            .steps
            .last()
            .and_then(|step| run.step_results.get(&step.id))
            .filter(|result| result.status == StepStatus::Success)
            .map(|result| result.output.clone())
            .unwrap_or_default())
    }
}

fn remaining_budget(token_limit: u64, usage: &crate::run::UsageStats) -> u64 {
    if token_limit == 0 {
        0
    } else {
        token_limit.saturating_sub(usage.totals.total_tokens).max(1)
    }
}

fn step_kind_name(workflow: &Arc<Workflow>, step_id: &str) -> &'static str {
    workflow
        .steps
        .iter()
        .find(|s| s.id == step_id)
        .map(|s| s.kind.name())
        .unwrap_or("unknown")
}

fn set_snapshot_step(
    snapshot: &mut Value,
    step_id: &str,
    output: Option<Map<String, Value>>,
    status: StepStatus,
) {
    let mut entry = Map::new();
    entry.insert(
        "status".to_string(),
        serde_json::to_value(status).unwrap_or(Value::Null),
    );
    if let Some(output) = output {
        entry.insert("output".to_string(), Value::Object(output));
    }
    if let Some(steps) = snapshot.get_mut("steps").and_then(Value::as_object_mut) {
        steps.insert(step_id.to_string(), Value::Object(entry));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ChatResponse, ProviderError};
    use async_trait::async_trait;
    use serde_json::json;

    /// Provider that answers each call with the next queued response.
    struct ScriptedProvider {
        responses: parking_lot::Mutex<Vec<ChatResponse>>,
    }

    impl ScriptedProvider {
        fn completing(text: &str, tokens: u64) -> Self {
            Self {
                responses: parking_lot::Mutex::new(vec![ChatResponse {
                    content: text.to_string(),
                    finish_reason: "stop".to_string(),
                    tool_calls: Vec::new(),
                    model: "mock".to_string(),
                    usage: TokenUsage {
                        input_tokens: tokens / 2,
                        output_tokens: tokens - tokens / 2,
                        total_tokens: tokens,
                        ..Default::default()
                    },
                }]),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            let mut responses = self.responses.lock();
            if responses.len() > 1 {
                Ok(responses.remove(0))
            } else {
                responses
                    .first()
                    .cloned()
                    .ok_or_else(|| ProviderError::Unknown("script exhausted".to_string()))
            }
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    fn llm_workflow(yaml: &str) -> Workflow {
        Workflow::from_yaml(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_simple_llm_run() {
        let workflow = llm_workflow(
            r#"
name: hello
steps:
  - id: greet
    type: llm
    model: mock-model
    prompt: "Say hello to {{ .inputs.name }}"
"#,
        );
        let executor = WorkflowExecutor::new()
            .with_provider("mock", Arc::new(ScriptedProvider::completing("hi there", 12)));

        let mut inputs = HashMap::new();
        inputs.insert("name".to_string(), json!("world"));

        let run = executor
            .run(
                CancellationToken::new(),
                &workflow,
                inputs,
                &ExecutorOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.step_results["greet"].status, StepStatus::Success);
        assert_eq!(run.usage.totals.total_tokens, 12);
        // No declared outputs: the last step's output is the run output.
        assert_eq!(run.output["response"], json!("hi there"));
    }

    #[tokio::test]
    async fn test_condition_false_skips_step() {
        let workflow = llm_workflow(
            r#"
name: guarded
steps:
  - id: maybe
    type: llm
    model: mock-model
    prompt: hello
    condition:
      expression: '{{ .inputs.env }} == "prod"'
"#,
        );
        let executor = WorkflowExecutor::new()
            .with_provider("mock", Arc::new(ScriptedProvider::completing("hi", 1)));

        let mut inputs = HashMap::new();
        inputs.insert("env".to_string(), json!("dev"));

        let run = executor
            .run(
                CancellationToken::new(),
                &workflow,
                inputs,
                &ExecutorOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.step_results["maybe"].status, StepStatus::Skipped);
        assert!(run.step_results["maybe"].output.is_empty());
    }

    #[tokio::test]
    async fn test_dependency_failure_blocks_successor() {
        let workflow = llm_workflow(
            r#"
name: chain
steps:
  - id: first
    type: llm
    model: mock-model
    prompt: hello
  - id: second
    type: llm
    model: mock-model
    prompt: again
    depends_on: [first]
"#,
        );

        struct FailingProvider;
        #[async_trait]
        impl LlmProvider for FailingProvider {
            async fn complete(&self, _r: ChatRequest) -> Result<ChatResponse, ProviderError> {
                Err(ProviderError::AuthError("bad key".to_string()))
            }
            fn name(&self) -> &str {
                "fail"
            }
        }

        let executor = WorkflowExecutor::new().with_provider("fail", Arc::new(FailingProvider));
        let run = executor
            .run(
                CancellationToken::new(),
                &workflow,
                HashMap::new(),
                &ExecutorOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.step_results["first"].status, StepStatus::Failed);
        // The dependent never started.
        assert!(!run.step_results.contains_key("second"));
    }

    #[tokio::test]
    async fn test_token_budget_fails_run() {
        let workflow = llm_workflow(
            r#"
name: budget
steps:
  - id: expensive
    type: llm
    model: mock-model
    prompt: hello
"#,
        );
        let executor = WorkflowExecutor::new()
            .with_provider("mock", Arc::new(ScriptedProvider::completing("hi", 500)));

        let options = ExecutorOptions {
            token_limit: 100,
            ..Default::default()
        };
        let run = executor
            .run(CancellationToken::new(), &workflow, HashMap::new(), &options)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("token limit exceeded"));
        // The overrunning step itself completed; the budget is enforced
        // after the step boundary.
        assert_eq!(run.step_results["expensive"].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn test_validation_rejects_before_execution() {
        let workflow = llm_workflow(
            r#"
name: broken
steps:
  - id: a
    type: llm
    model: m
    prompt: hi
    depends_on: [b]
  - id: b
    type: llm
    model: m
    prompt: hi
    depends_on: [a]
"#,
        );
        let executor = WorkflowExecutor::new();
        let err = executor
            .run(
                CancellationToken::new(),
                &workflow,
                HashMap::new(),
                &ExecutorOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_tool_server_allow_list() {
        let workflow = llm_workflow(
            r#"
name: needs-server
requires:
  tool_servers: [code-search]
steps:
  - id: a
    type: llm
    model: m
    prompt: hi
"#,
        );
        let executor = WorkflowExecutor::new()
            .with_provider("mock", Arc::new(ScriptedProvider::completing("hi", 1)));

        let err = executor
            .run(
                CancellationToken::new(),
                &workflow,
                HashMap::new(),
                &ExecutorOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("tool server"));

        let options = ExecutorOptions {
            allowed_tool_servers: vec!["code-search".to_string()],
            ..Default::default()
        };
        let run = executor
            .run(CancellationToken::new(), &workflow, HashMap::new(), &options)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }
}
