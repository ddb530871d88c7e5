// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding façade over the core executor.
//!
//! An [`Engine`] wires providers, tools, event handlers, the checkpoint
//! store and the run store into one handle an application can hold.
//! Credentials handed to the engine are owned copies; the buffers are
//! zeroed when the engine is dropped.

use crate::store::RunStore;
use crate::tools::TruncateCodeTool;
use llm_workflow_core::checkpoint::{Checkpoint, CheckpointStore};
use llm_workflow_core::error::{EngineError, Result};
use llm_workflow_core::events::{EventBus, EventHandler, EventKind};
use llm_workflow_core::executor::{ExecutorOptions, WorkflowExecutor};
use llm_workflow_core::providers::LlmProvider;
use llm_workflow_core::run::Run;
use llm_workflow_core::tools::{Tool, ToolRegistry};
use llm_workflow_core::workflow::Workflow;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Credential map whose secret bytes are zeroed on drop.
#[derive(Default)]
struct SecretStore {
    secrets: HashMap<String, Vec<u8>>,
}

impl SecretStore {
    fn insert(&mut self, name: String, secret: &str) {
        self.secrets.insert(name, secret.as_bytes().to_vec());
    }

    fn as_map(&self) -> HashMap<String, String> {
        self.secrets
            .iter()
            .map(|(name, bytes)| {
                (
                    name.clone(),
                    String::from_utf8_lossy(bytes).into_owned(),
                )
            })
            .collect()
    }
}

impl Drop for SecretStore {
    fn drop(&mut self) {
        for bytes in self.secrets.values_mut() {
            bytes.iter_mut().for_each(|b| *b = 0);
        }
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    providers: Vec<(String, Arc<dyn LlmProvider>)>,
    tools: Vec<Arc<dyn Tool>>,
    handlers: Vec<(EventKind, EventHandler)>,
    credentials: SecretStore,
    checkpoint_dir: Option<PathBuf>,
    default_provider: Option<String>,
    store_capacity: usize,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            tools: Vec::new(),
            handlers: Vec::new(),
            credentials: SecretStore::default(),
            checkpoint_dir: None,
            default_provider: None,
            store_capacity: crate::store::DEFAULT_CAPACITY,
        }
    }
}

impl EngineBuilder {
    /// Registers an LLM provider.
    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers.push((name.into(), provider));
        self
    }

    /// Registers a tool.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Registers an event handler.
    pub fn with_event_handler(mut self, kind: EventKind, handler: EventHandler) -> Self {
        self.handlers.push((kind, handler));
        self
    }

    /// Stores a credential for an integration.
    pub fn with_credential(mut self, integration: impl Into<String>, secret: &str) -> Self {
        self.credentials.insert(integration.into(), secret);
        self
    }

    /// Enables checkpointing under the given directory.
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Names the provider used when a step names none.
    pub fn with_default_provider(mut self, name: impl Into<String>) -> Self {
        self.default_provider = Some(name.into());
        self
    }

    /// Overrides the run store capacity.
    pub fn with_store_capacity(mut self, capacity: usize) -> Self {
        self.store_capacity = capacity;
        self
    }

    /// Builds the engine.
    pub fn build(self) -> Result<Engine> {
        let events = Arc::new(EventBus::new());
        for (kind, handler) in self.handlers {
            events.on(kind, handler);
        }

        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(TruncateCodeTool));
        for tool in self.tools {
            tools.register(tool);
        }

        let checkpoints = match &self.checkpoint_dir {
            Some(dir) => Arc::new(
                CheckpointStore::new(dir.clone())
                    .map_err(|e| EngineError::Checkpoint(e.to_string()))?,
            ),
            None => Arc::new(CheckpointStore::disabled()),
        };

        let mut executor = WorkflowExecutor::new()
            .with_tools(tools.clone())
            .with_events(events.clone())
            .with_checkpoints(checkpoints.clone());
        for (name, provider) in self.providers {
            executor = executor.with_provider(name, provider);
        }

        Ok(Engine {
            executor,
            events,
            tools,
            checkpoints,
            store: Arc::new(RunStore::new(self.store_capacity)),
            credentials: self.credentials,
            default_provider: self.default_provider,
        })
    }
}

/// Run-level knobs exposed by the façade.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Per-run cumulative token limit (0 = unlimited).
    pub token_limit: u64,
    /// External tool servers the run may use.
    pub allowed_tool_servers: Vec<String>,
    /// Concurrent top-level steps (0 or 1 = sequential).
    pub max_parallel_steps: usize,
}

/// The embeddable workflow engine.
pub struct Engine {
    executor: WorkflowExecutor,
    events: Arc<EventBus>,
    tools: Arc<ToolRegistry>,
    checkpoints: Arc<CheckpointStore>,
    store: Arc<RunStore>,
    credentials: SecretStore,
    default_provider: Option<String>,
}

impl Engine {
    /// Starts a builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Loads, validates and runs a workflow file. The file's directory
    /// anchors sub-workflow resolution.
    pub async fn run_file(
        &self,
        cancel: CancellationToken,
        path: impl AsRef<Path>,
        inputs: HashMap<String, Value>,
        options: &RunOptions,
    ) -> Result<Run> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Validation(format!("failed to read workflow file: {}", e))
        })?;
        let workflow = Workflow::from_yaml(&content)?;
        let dir = path.parent().map(|p| p.to_path_buf());
        self.run_workflow(cancel, &workflow, inputs, options, dir).await
    }

    /// Runs an in-memory workflow definition.
    pub async fn run_workflow(
        &self,
        cancel: CancellationToken,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
        options: &RunOptions,
        workflow_dir: Option<PathBuf>,
    ) -> Result<Run> {
        let executor_options = ExecutorOptions {
            token_limit: options.token_limit,
            credentials: self.credentials.as_map(),
            allowed_tool_servers: options.allowed_tool_servers.clone(),
            max_parallel_steps: options.max_parallel_steps,
            default_provider: self.default_provider.clone(),
            workflow_dir,
        };

        let run = self
            .executor
            .run(cancel, workflow, inputs, &executor_options)
            .await?;

        self.store.save_run(&run);
        info!(run_id = %run.run_id, status = ?run.status, "Run recorded");
        Ok(run)
    }

    /// The engine's run store.
    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// The engine's event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The engine's tool registry.
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Checkpoints of interrupted runs.
    pub fn list_interrupted(&self) -> Result<Vec<Checkpoint>> {
        self.checkpoints
            .list_interrupted()
            .map_err(|e| EngineError::Checkpoint(e.to_string()))
    }

    /// Shuts the engine down, zeroing its credential copies.
    pub fn close(self) {
        drop(self);
    }
}
