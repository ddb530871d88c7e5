// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Agent loop scenarios against scripted providers.

mod common;

use common::{response, tool_call_response, FixedTool, ScriptedProvider};
use llm_workflow_core::agent::{AgentConfig, AgentRunner, AgentStatus, StopReason};
use llm_workflow_core::events::{Event, EventKind};
use llm_workflow_core::providers::ToolCall;
use llm_workflow_core::tools::ToolRegistry;
use parking_lot::Mutex;
use serde_json::{json, Map};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn registry_with(tool: FixedTool) -> Arc<ToolRegistry> {
    let registry = ToolRegistry::new();
    registry.register(Arc::new(tool));
    Arc::new(registry)
}

#[tokio::test]
async fn test_simple_completion() {
    let provider = Arc::new(ScriptedProvider::new(vec![response(
        "Task completed successfully",
        "stop",
        15,
    )]));
    let runner = AgentRunner::new(provider, Arc::new(ToolRegistry::new()), "mock-model");

    let result = runner.run("sys", "task").await.unwrap();

    assert_eq!(result.status, AgentStatus::Completed);
    assert_eq!(result.reason, StopReason::TaskCompleted);
    assert_eq!(result.final_response, "Task completed successfully");
    assert_eq!(result.iterations, 1);
    assert_eq!(result.tokens_used.total_tokens, 15);
    assert!(result.tool_executions.is_empty());
}

#[tokio::test]
async fn test_tool_use_round_trip() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(
            vec![ToolCall {
                id: "c1".to_string(),
                name: "t".to_string(),
                arguments: json!({"x": 1}),
            }],
            15,
        ),
        response("done", "stop", 10),
    ]));

    let mut tool_result = Map::new();
    tool_result.insert("ok".to_string(), json!(true));
    let registry = registry_with(FixedTool::new("t", tool_result));

    let runner = AgentRunner::new(provider, registry, "mock-model")
        .with_allowed_tools(vec!["t".to_string()]);

    let result = runner.run("sys", "use the tool").await.unwrap();

    assert_eq!(result.status, AgentStatus::Completed);
    assert_eq!(result.iterations, 2);
    assert_eq!(result.tool_executions.len(), 1);
    let execution = &result.tool_executions[0];
    assert!(execution.success);
    assert_eq!(execution.call_id, "c1");
    assert_eq!(execution.inputs["x"], json!(1));
    assert_eq!(execution.outputs.as_ref().unwrap()["ok"], json!(true));
    assert_eq!(result.tokens_used.total_tokens, 25);
}

#[tokio::test]
async fn test_max_iterations() {
    let provider = Arc::new(ScriptedProvider::repeating(response("...", "length", 10)));
    let runner = AgentRunner::new(provider, Arc::new(ToolRegistry::new()), "mock-model")
        .with_config(AgentConfig {
            max_iterations: 3,
            ..Default::default()
        });

    let result = runner.run("sys", "never stops").await.unwrap();

    assert_eq!(result.status, AgentStatus::LimitExceeded);
    assert_eq!(result.reason, StopReason::MaxIterations);
    assert_eq!(result.iterations, 3);
}

#[tokio::test]
async fn test_token_budget() {
    // 15 tokens per call against a 20-token budget: the second call
    // crosses the line and terminates the run.
    let provider = Arc::new(ScriptedProvider::repeating(response("partial", "length", 15)));
    let runner = AgentRunner::new(provider, Arc::new(ToolRegistry::new()), "mock-model")
        .with_config(AgentConfig {
            token_limit: 20,
            ..Default::default()
        });

    let result = runner.run("sys", "expensive").await.unwrap();

    assert_eq!(result.status, AgentStatus::LimitExceeded);
    assert_eq!(result.reason, StopReason::TokenLimit);
    assert_eq!(result.iterations, 2);
    // Budget overshoot is bounded by the last response's usage.
    assert!(result.tokens_used.total_tokens <= 20 + 15);
    assert_eq!(result.final_response, "partial");
}

#[tokio::test]
async fn test_stop_on_tool_error() {
    struct BrokenTool;

    #[async_trait::async_trait]
    impl llm_workflow_core::tools::Tool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn execute(
            &self,
            _inputs: Map<String, serde_json::Value>,
        ) -> Result<Map<String, serde_json::Value>, String> {
            Err("tool blew up".to_string())
        }
    }

    let provider = Arc::new(ScriptedProvider::repeating(tool_call_response(
        vec![ToolCall {
            id: "c1".to_string(),
            name: "broken".to_string(),
            arguments: json!({}),
        }],
        5,
    )));

    let registry = ToolRegistry::new();
    registry.register(Arc::new(BrokenTool));

    let runner = AgentRunner::new(provider, Arc::new(registry), "mock-model")
        .with_allowed_tools(vec!["broken".to_string()])
        .with_config(AgentConfig {
            stop_on_error: true,
            ..Default::default()
        });

    let result = runner.run("sys", "try it").await.unwrap();

    assert_eq!(result.status, AgentStatus::Error);
    assert_eq!(result.reason, StopReason::ToolError);
    assert_eq!(result.tool_executions.len(), 1);
    assert!(!result.tool_executions[0].success);
    assert_eq!(result.error.as_deref(), Some("tool blew up"));
}

#[tokio::test]
async fn test_invalid_arguments_fail_tool_without_invoking() {
    let mut tool_result = Map::new();
    tool_result.insert("ok".to_string(), json!(true));
    let tool = FixedTool::new("t", tool_result);
    let calls = tool.calls.clone();

    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(
            vec![ToolCall {
                id: "c1".to_string(),
                name: "t".to_string(),
                arguments: json!([1, 2, 3]), // neither map nor string
            }],
            5,
        ),
        response("recovered", "stop", 5),
    ]));

    let runner = AgentRunner::new(provider, registry_with(tool), "mock-model")
        .with_allowed_tools(vec!["t".to_string()]);

    let result = runner.run("sys", "go").await.unwrap();

    assert_eq!(result.status, AgentStatus::Completed);
    let execution = &result.tool_executions[0];
    assert!(!execution.success);
    assert!(execution.error.as_deref().unwrap().contains("invalid_arguments"));
    // The tool itself never ran.
    assert!(calls.lock().is_empty());
}

#[tokio::test]
async fn test_string_arguments_wrapped_as_raw() {
    let mut tool_result = Map::new();
    tool_result.insert("ok".to_string(), json!(true));
    let tool = FixedTool::new("t", tool_result);
    let calls = tool.calls.clone();

    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(
            vec![ToolCall {
                id: "c1".to_string(),
                name: "t".to_string(),
                arguments: json!("plain text args"),
            }],
            5,
        ),
        response("done", "stop", 5),
    ]));

    let runner = AgentRunner::new(provider, registry_with(tool), "mock-model")
        .with_allowed_tools(vec!["t".to_string()]);

    let result = runner.run("sys", "go").await.unwrap();
    assert!(result.tool_executions[0].success);
    assert_eq!(calls.lock()[0]["raw"], json!("plain text args"));
}

#[tokio::test]
async fn test_events_emitted_in_order() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call_response(
            vec![ToolCall {
                id: "c1".to_string(),
                name: "t".to_string(),
                arguments: json!({}),
            }],
            5,
        ),
        response("done", "stop", 5),
    ]));

    let mut tool_result = Map::new();
    tool_result.insert("ok".to_string(), json!(true));
    let registry = registry_with(FixedTool::new("t", tool_result));

    let seen: Arc<Mutex<Vec<EventKind>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    let sink: Arc<dyn Fn(&Event) + Send + Sync> =
        Arc::new(move |event| sink_seen.lock().push(event.kind));

    let runner = AgentRunner::new(provider, registry, "mock-model")
        .with_allowed_tools(vec!["t".to_string()])
        .with_events(sink);

    runner.run("sys", "go").await.unwrap();

    let kinds = seen.lock().clone();
    // Iteration, the requested call, its chunk stream, then the result.
    assert_eq!(kinds[0], EventKind::AgentIteration);
    let call_pos = kinds.iter().position(|k| *k == EventKind::LlmToolCall).unwrap();
    let output_pos = kinds.iter().position(|k| *k == EventKind::ToolOutput).unwrap();
    let result_pos = kinds.iter().position(|k| *k == EventKind::LlmToolResult).unwrap();
    assert!(call_pos < output_pos);
    assert!(output_pos < result_pos);
}

#[tokio::test]
async fn test_cancellation_surfaces_as_error() {
    struct SlowProvider;

    #[async_trait::async_trait]
    impl llm_workflow_core::providers::LlmProvider for SlowProvider {
        async fn complete(
            &self,
            _request: llm_workflow_core::providers::ChatRequest,
        ) -> Result<
            llm_workflow_core::providers::ChatResponse,
            llm_workflow_core::providers::ProviderError,
        > {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            unreachable!()
        }
        fn name(&self) -> &str {
            "slow"
        }
    }

    let cancel = CancellationToken::new();
    let runner = AgentRunner::new(
        Arc::new(SlowProvider),
        Arc::new(ToolRegistry::new()),
        "mock-model",
    )
    .with_cancellation(cancel.clone());

    let handle = tokio::spawn(async move { runner.run("sys", "hang").await });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    cancel.cancel();

    let result = handle.await.unwrap();
    assert!(matches!(
        result,
        Err(llm_workflow_core::error::EngineError::Cancelled)
    ));
}
