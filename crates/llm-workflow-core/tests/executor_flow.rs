// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end executor scenarios with scripted providers.

mod common;

use common::{response, EchoProvider, ScriptedProvider};
use llm_workflow_core::error::EngineError;
use llm_workflow_core::executor::{ExecutorOptions, WorkflowExecutor};
use llm_workflow_core::providers::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
use llm_workflow_core::run::{RunStatus, StepStatus};
use llm_workflow_core::workflow::Workflow;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn workflow(yaml: &str) -> Workflow {
    Workflow::from_yaml(yaml).unwrap()
}

async fn run_with(
    executor: &WorkflowExecutor,
    wf: &Workflow,
    inputs: HashMap<String, Value>,
    options: &ExecutorOptions,
) -> llm_workflow_core::run::Run {
    executor
        .run(CancellationToken::new(), wf, inputs, options)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_dependency_order_with_parallel_workers() {
    let wf = workflow(
        r#"
name: diamond
steps:
  - id: a
    type: llm
    model: m
    prompt: "step:a"
  - id: b
    type: llm
    model: m
    prompt: "step:b"
    depends_on: [a]
  - id: c
    type: llm
    model: m
    prompt: "step:c"
    depends_on: [a]
  - id: d
    type: llm
    model: m
    prompt: "step:d"
    depends_on: [b, c]
"#,
    );

    let provider = Arc::new(ScriptedProvider::repeating(response("ok", "stop", 3)));
    let executor = WorkflowExecutor::new().with_provider("scripted", provider.clone());

    let options = ExecutorOptions {
        max_parallel_steps: 2,
        ..Default::default()
    };
    let run = run_with(&executor, &wf, HashMap::new(), &options).await;

    assert_eq!(run.status, RunStatus::Completed);
    for id in ["a", "b", "c", "d"] {
        assert_eq!(run.step_results[id].status, StepStatus::Success);
    }

    // No step started before its dependencies finished: the provider saw
    // a first, d last.
    let prompts = provider.prompts.lock().clone();
    let pos = |needle: &str| prompts.iter().position(|p| p == needle).unwrap();
    assert_eq!(pos("step:a"), 0);
    assert_eq!(pos("step:d"), 3);

    // Usage totals equal the per-step sum.
    let sum: u64 = run.usage.per_step.values().map(|u| u.total_tokens).sum();
    assert_eq!(run.usage.totals.total_tokens, sum);
    assert_eq!(sum, 12);
}

#[tokio::test]
async fn test_declared_outputs_rendered() {
    let wf = workflow(
        r#"
name: outputs
steps:
  - id: think
    type: llm
    model: m
    prompt: "question"
outputs:
  answer: "{{ .steps.think.output.response }}"
  verbatim: fixed-value
"#,
    );

    let executor = WorkflowExecutor::new()
        .with_provider("scripted", Arc::new(ScriptedProvider::repeating(response("42", "stop", 2))));
    let run = run_with(&executor, &wf, HashMap::new(), &ExecutorOptions::default()).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output["answer"], json!("42"));
    assert_eq!(run.output["verbatim"], json!("fixed-value"));
}

#[tokio::test]
async fn test_parallel_foreach_binds_item_in_order() {
    let wf = workflow(
        r#"
name: fanout
inputs:
  items:
    type: array
    required: true
steps:
  - id: fan
    type: parallel
    foreach: "{{ .inputs.items }}"
    max_concurrency: 2
    steps:
      - id: work
        type: llm
        model: m
        prompt: "item={{ .item }}"
"#,
    );

    let executor = WorkflowExecutor::new().with_provider("echo", Arc::new(EchoProvider));

    let mut inputs = HashMap::new();
    inputs.insert("items".to_string(), json!(["x", "y", "z"]));
    let run = run_with(&executor, &wf, inputs, &ExecutorOptions::default()).await;

    assert_eq!(run.status, RunStatus::Completed);
    let results = run.step_results["fan"].output["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    // Iteration outputs keep input order regardless of completion order.
    for (i, expected) in ["x", "y", "z"].iter().enumerate() {
        assert_eq!(
            results[i]["work"]["response"],
            json!(format!("echo: item={}", expected))
        );
    }
}

#[tokio::test]
async fn test_parallel_children_without_foreach() {
    let wf = workflow(
        r#"
name: siblings
steps:
  - id: both
    type: parallel
    steps:
      - id: left
        type: llm
        model: m
        prompt: "left"
      - id: right
        type: llm
        model: m
        prompt: "right"
"#,
    );

    let executor = WorkflowExecutor::new().with_provider("echo", Arc::new(EchoProvider));
    let run = run_with(&executor, &wf, HashMap::new(), &ExecutorOptions::default()).await;

    assert_eq!(run.status, RunStatus::Completed);
    let output = &run.step_results["both"].output;
    assert_eq!(output["left"]["response"], json!("echo: left"));
    assert_eq!(output["right"]["response"], json!("echo: right"));
    // Children get their own result records.
    assert_eq!(run.step_results["left"].status, StepStatus::Success);
    assert_eq!(run.step_results["right"].status, StepStatus::Success);
}

#[tokio::test]
async fn test_condition_branches() {
    let yaml = r#"
name: branching
inputs:
  env:
    type: string
    required: true
steps:
  - id: gate
    type: condition
    expression: '{{ .inputs.env }} == "prod"'
    then:
      - id: real
        type: llm
        model: m
        prompt: "deploying"
    else:
      - id: pretend
        type: llm
        model: m
        prompt: "dry run"
"#;
    let wf = workflow(yaml);
    let executor = WorkflowExecutor::new().with_provider("echo", Arc::new(EchoProvider));

    let mut inputs = HashMap::new();
    inputs.insert("env".to_string(), json!("prod"));
    let run = run_with(&executor, &wf, inputs, &ExecutorOptions::default()).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.step_results["gate"].output.contains_key("real"));
    assert_eq!(run.step_results["real"].status, StepStatus::Success);
    assert!(!run.step_results.contains_key("pretend"));

    let mut inputs = HashMap::new();
    inputs.insert("env".to_string(), json!("dev"));
    let run = run_with(&executor, &wf, inputs, &ExecutorOptions::default()).await;
    assert!(run.step_results["gate"].output.contains_key("pretend"));
}

#[tokio::test]
async fn test_empty_condition_branch_is_skipped() {
    let wf = workflow(
        r#"
name: empty-branch
steps:
  - id: gate
    type: condition
    expression: "false"
    then:
      - id: never
        type: llm
        model: m
        prompt: "nope"
"#,
    );

    let executor = WorkflowExecutor::new().with_provider("echo", Arc::new(EchoProvider));
    let run = run_with(&executor, &wf, HashMap::new(), &ExecutorOptions::default()).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.step_results["gate"].status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_sub_workflow_runs_and_rolls_up_usage() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("child.yaml"),
        r#"
name: child
inputs:
  topic:
    type: string
    required: true
steps:
  - id: inner
    type: llm
    model: m
    prompt: "child sees {{ .inputs.topic }}"
outputs:
  summary: "{{ .steps.inner.output.response }}"
"#,
    )
    .unwrap();

    let wf = workflow(
        r#"
name: parent
steps:
  - id: delegate
    type: sub_workflow
    workflow: child.yaml
    inputs:
      topic: "{{ .inputs.subject }}"
inputs:
  subject:
    type: string
    required: true
"#,
    );

    let executor = WorkflowExecutor::new().with_provider("echo", Arc::new(EchoProvider));
    let options = ExecutorOptions {
        workflow_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };

    let mut inputs = HashMap::new();
    inputs.insert("subject".to_string(), json!("rust"));
    let run = run_with(&executor, &wf, inputs, &options).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(
        run.step_results["delegate"].output["summary"],
        json!("echo: child sees rust")
    );
    // The child's tokens rolled into the parent run.
    assert_eq!(run.usage.totals.total_tokens, 4);
}

#[tokio::test]
async fn test_step_retry_until_success() {
    struct FlakyProvider {
        failures_left: parking_lot::Mutex<u32>,
        calls: parking_lot::Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl LlmProvider for FlakyProvider {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            *self.calls.lock() += 1;
            let mut failures = self.failures_left.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ProviderError::Unknown("transient".to_string()));
            }
            Ok(response("finally", "stop", 2))
        }
        fn name(&self) -> &str {
            "flaky"
        }
    }

    let wf = workflow(
        r#"
name: retrying
steps:
  - id: flaky
    type: llm
    model: m
    prompt: "try"
    retry:
      max_attempts: 3
      backoff_base: 0.01
      backoff_multiplier: 1.0
"#,
    );

    let provider = Arc::new(FlakyProvider {
        failures_left: parking_lot::Mutex::new(2),
        calls: parking_lot::Mutex::new(0),
    });
    let executor = WorkflowExecutor::new().with_provider("flaky", provider.clone());

    let run = run_with(&executor, &wf, HashMap::new(), &ExecutorOptions::default()).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(*provider.calls.lock(), 3);
}

#[tokio::test]
async fn test_cancellation_marks_run_cancelled() {
    struct HangingProvider;

    #[async_trait::async_trait]
    impl LlmProvider for HangingProvider {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            unreachable!()
        }
        fn name(&self) -> &str {
            "hang"
        }
    }

    let wf = workflow(
        r#"
name: hangs
steps:
  - id: stuck
    type: llm
    model: m
    prompt: "forever"
"#,
    );

    let executor = WorkflowExecutor::new().with_provider("hang", Arc::new(HangingProvider));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let run = executor
        .run(cancel, &wf, HashMap::new(), &ExecutorOptions::default())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.step_results["stuck"].status, StepStatus::Failed);
}

#[tokio::test]
async fn test_step_timeout_fails_step() {
    struct SlowProvider;

    #[async_trait::async_trait]
    impl LlmProvider for SlowProvider {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            Ok(response("late", "stop", 1))
        }
        fn name(&self) -> &str {
            "slow"
        }
    }

    let wf = workflow(
        r#"
name: timed
steps:
  - id: slow
    type: llm
    model: m
    prompt: "hurry"
    timeout: 1
"#,
    );

    let executor = WorkflowExecutor::new().with_provider("slow", Arc::new(SlowProvider));
    let started = std::time::Instant::now();
    let run = run_with(&executor, &wf, HashMap::new(), &ExecutorOptions::default()).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.step_results["slow"].status, StepStatus::Failed);
    assert!(started.elapsed() < std::time::Duration::from_secs(8));
}

#[tokio::test]
async fn test_missing_required_input_is_validation_error() {
    let wf = workflow(
        r#"
name: strict
inputs:
  must_have:
    type: string
    required: true
steps:
  - id: a
    type: llm
    model: m
    prompt: "{{ .inputs.must_have }}"
"#,
    );

    let executor = WorkflowExecutor::new().with_provider("echo", Arc::new(EchoProvider));
    let err = executor
        .run(
            CancellationToken::new(),
            &wf,
            HashMap::new(),
            &ExecutorOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_checkpoint_written_and_deleted_on_completion() {
    let dir = tempfile::TempDir::new().unwrap();
    let checkpoints = Arc::new(
        llm_workflow_core::checkpoint::CheckpointStore::new(dir.path().join("cp")).unwrap(),
    );

    let wf = workflow(
        r#"
name: checkpointed
steps:
  - id: only
    type: llm
    model: m
    prompt: "hello"
"#,
    );

    let executor = WorkflowExecutor::new()
        .with_provider("echo", Arc::new(EchoProvider))
        .with_checkpoints(checkpoints.clone());

    let run = run_with(&executor, &wf, HashMap::new(), &ExecutorOptions::default()).await;
    assert_eq!(run.status, RunStatus::Completed);
    // Completion deletes the checkpoint.
    assert!(checkpoints.load(run.run_id).unwrap().is_none());
    assert!(checkpoints.list_interrupted().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_run_keeps_checkpoint() {
    struct FailingProvider;

    #[async_trait::async_trait]
    impl LlmProvider for FailingProvider {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            Err(ProviderError::AuthError("denied".to_string()))
        }
        fn name(&self) -> &str {
            "failing"
        }
    }

    let dir = tempfile::TempDir::new().unwrap();
    let checkpoints = Arc::new(
        llm_workflow_core::checkpoint::CheckpointStore::new(dir.path().join("cp")).unwrap(),
    );

    let wf = workflow(
        r#"
name: doomed
steps:
  - id: only
    type: llm
    model: m
    prompt: "hello"
"#,
    );

    let executor = WorkflowExecutor::new()
        .with_provider("failing", Arc::new(FailingProvider))
        .with_checkpoints(checkpoints.clone());

    let run = run_with(&executor, &wf, HashMap::new(), &ExecutorOptions::default()).await;
    assert_eq!(run.status, RunStatus::Failed);
    // The checkpoint of the failed run survives as a resume aid.
    let interrupted = checkpoints.list_interrupted().unwrap();
    assert_eq!(interrupted.len(), 1);
    assert_eq!(interrupted[0].run_id, run.run_id);
}
