// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The code truncator exposed as an engine tool.

use async_trait::async_trait;
use llm_workflow_core::tools::Tool;
use llm_workflow_core::truncate::{truncate_code, TruncateError, TruncateOptions};
use serde_json::{json, Map, Value};

/// Deterministic structure-aware code shortening for LLM steps.
pub struct TruncateCodeTool;

impl TruncateCodeTool {
    fn parse_options(inputs: &Map<String, Value>) -> Result<TruncateOptions, TruncateError> {
        let mut options = TruncateOptions::default();

        if let Some(n) = Self::bound(inputs, "max_lines")? {
            options.max_lines = n;
        }
        if let Some(n) = Self::bound(inputs, "max_tokens")? {
            options.max_tokens = n;
        }
        if let Some(n) = Self::bound(inputs, "max_bytes")? {
            options.max_bytes = n;
        }

        if let Some(language) = inputs.get("language").and_then(Value::as_str) {
            options.language = language.to_string();
        }
        options.preserve_top = inputs
            .get("preserve_top")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        options.preserve_func = inputs
            .get("preserve_func")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(options)
    }

    fn bound(inputs: &Map<String, Value>, field: &str) -> Result<Option<usize>, TruncateError> {
        match inputs.get(field) {
            None => Ok(None),
            Some(value) => {
                let number = value.as_i64().ok_or_else(|| {
                    TruncateError::InvalidOptions(format!("'{}' must be an integer", field))
                })?;
                if number < 0 {
                    return Err(TruncateError::InvalidOptions(format!(
                        "'{}' must not be negative",
                        field
                    )));
                }
                Ok(Some(number as usize))
            }
        }
    }
}

#[async_trait]
impl Tool for TruncateCodeTool {
    fn name(&self) -> &str {
        "truncate_code"
    }

    fn description(&self) -> &str {
        "Shortens source code to fit a line or token budget while keeping whole \
         functions, classes and the import section intact"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["content"],
            "properties": {
                "content": {"type": "string", "description": "Source code to shorten"},
                "max_lines": {"type": "integer", "minimum": 0},
                "max_tokens": {"type": "integer", "minimum": 0},
                "max_bytes": {"type": "integer", "minimum": 0},
                "language": {
                    "type": "string",
                    "description": "go, typescript, python, javascript, or empty"
                },
                "preserve_top": {"type": "boolean"},
                "preserve_func": {"type": "boolean"}
            }
        })
    }

    async fn execute(&self, inputs: Map<String, Value>) -> Result<Map<String, Value>, String> {
        let content = inputs
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing required input 'content'".to_string())?;

        let options = Self::parse_options(&inputs).map_err(|e| e.to_string())?;
        let result = truncate_code(content, &options).map_err(|e| e.to_string())?;

        match serde_json::to_value(&result) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err("failed to serialize truncation result".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_truncates_through_tool_interface() {
        let tool = TruncateCodeTool;
        let mut inputs = Map::new();
        inputs.insert(
            "content".to_string(),
            json!("line1\nline2\nline3\nline4\nline5"),
        );
        inputs.insert("max_lines".to_string(), json!(2));

        let outputs = tool.execute(inputs).await.unwrap();
        assert_eq!(outputs["was_truncated"], json!(true));
        assert!(outputs["content"].as_str().unwrap().contains("line1"));
        assert!(!outputs["content"].as_str().unwrap().contains("line5"));
    }

    #[tokio::test]
    async fn test_negative_option_rejected() {
        let tool = TruncateCodeTool;
        let mut inputs = Map::new();
        inputs.insert("content".to_string(), json!("hello"));
        inputs.insert("max_lines".to_string(), json!(-5));

        let err = tool.execute(inputs).await.unwrap_err();
        assert!(err.contains("must not be negative"));
    }

    #[tokio::test]
    async fn test_missing_content_rejected() {
        let tool = TruncateCodeTool;
        let err = tool.execute(Map::new()).await.unwrap_err();
        assert!(err.contains("content"));
    }

    #[tokio::test]
    async fn test_unchanged_when_fits() {
        let tool = TruncateCodeTool;
        let mut inputs = Map::new();
        inputs.insert("content".to_string(), json!("short"));

        let outputs = tool.execute(inputs).await.unwrap();
        assert_eq!(outputs["was_truncated"], json!(false));
        assert_eq!(outputs["content"], json!("short"));
    }
}
