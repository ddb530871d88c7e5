// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the workflow engine.

use std::time::Duration;

/// Convenience result alias used throughout the engine.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Top-level engine error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Workflow shape is invalid (duplicate ids, bad dependencies, cycles,
    /// bad template references, type mismatches). Surfaced before execution.
    #[error("workflow validation failed: {0}")]
    Validation(String),

    /// Sub-workflow loader rejection.
    #[error(transparent)]
    Loader(#[from] crate::subworkflow::LoaderError),

    /// Per-run token budget exhausted.
    #[error("token limit exceeded: limit {limit}, actual {actual}")]
    TokenLimitExceeded {
        /// Configured limit.
        limit: u64,
        /// Observed total at the time of the check.
        actual: u64,
    },

    /// A step failed; wraps the underlying cause.
    #[error("step '{step_id}' failed: {source}")]
    Step {
        /// Id of the failing step.
        step_id: String,
        /// Underlying cause.
        #[source]
        source: Box<EngineError>,
    },

    /// LLM provider error.
    #[error(transparent)]
    Provider(#[from] crate::providers::ProviderError),

    /// Integration call error.
    #[error(transparent)]
    Integration(#[from] crate::integration::IntegrationError),

    /// Tool runtime error.
    #[error("tool '{name}' failed: {message}")]
    Tool {
        /// Tool name.
        name: String,
        /// Error message from the final chunk.
        message: String,
    },

    /// Template evaluation error (missing reference, bad expression).
    #[error("template error: {0}")]
    Template(String),

    /// LLM output did not match the declared schema.
    #[error("output schema validation failed: {0}")]
    Schema(String),

    /// The run or step was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// A step exceeded its configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Checkpoint I/O error. Logged by the executor, never fatal to the run.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Creates a generic error from any displayable value.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Wraps an error with the id of the step that produced it.
    pub fn for_step(step_id: impl Into<String>, source: EngineError) -> Self {
        Self::Step {
            step_id: step_id.into(),
            source: Box::new(source),
        }
    }

    /// Whether a retry may succeed.
    ///
    /// Validation, cancellation, budget, path-safety and schema errors are
    /// deterministic and never retried. Provider errors consult the
    /// provider's own classification.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_)
            | Self::Loader(_)
            | Self::TokenLimitExceeded { .. }
            | Self::Template(_)
            | Self::Schema(_)
            | Self::Cancelled
            | Self::Checkpoint(_) => false,
            Self::Step { source, .. } => source.is_retryable(),
            Self::Provider(e) => e.is_retryable(),
            Self::Integration(e) => e.is_retryable(),
            Self::Tool { .. } => false,
            Self::Timeout(_) | Self::Other(_) => true,
        }
    }

    /// A display string safe to show to end users: excludes prompts, file
    /// paths and tool outputs that the full message chain may contain.
    pub fn safe_message(&self) -> String {
        match self {
            Self::Validation(_) => "workflow validation failed".to_string(),
            Self::Loader(e) => e.safe_message(),
            Self::TokenLimitExceeded { limit, actual } => {
                format!("token limit exceeded: limit {}, actual {}", limit, actual)
            }
            Self::Step { step_id, source } => {
                format!("step '{}' failed: {}", step_id, source.safe_message())
            }
            Self::Provider(e) => format!("provider error ({})", e.category()),
            Self::Integration(_) => "integration call failed".to_string(),
            Self::Tool { name, .. } => format!("tool '{}' failed", name),
            Self::Template(_) => "template evaluation failed".to_string(),
            Self::Schema(_) => "output schema validation failed".to_string(),
            Self::Cancelled => "cancelled".to_string(),
            Self::Timeout(d) => format!("timed out after {:?}", d),
            Self::Checkpoint(_) => "checkpoint error".to_string(),
            Self::Other(_) => "execution failed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;

    #[test]
    fn test_step_error_preserves_chain() {
        let inner = EngineError::Template("missing reference steps.x".to_string());
        let err = EngineError::for_step("summarize", inner);

        let msg = err.to_string();
        assert!(msg.contains("step 'summarize' failed"));
        assert!(msg.contains("missing reference"));

        // The source chain is preserved for inspection.
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("template error"));
    }

    #[test]
    fn test_safe_message_excludes_detail() {
        let inner = EngineError::Template("missing reference in prompt 'secret sauce'".to_string());
        let err = EngineError::for_step("summarize", inner);

        let safe = err.safe_message();
        assert!(safe.contains("step 'summarize' failed"));
        assert!(!safe.contains("secret sauce"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!EngineError::Validation("dup".to_string()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(EngineError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(EngineError::Provider(ProviderError::RateLimitExceeded).is_retryable());
        assert!(!EngineError::Provider(ProviderError::AuthError("bad key".to_string()))
            .is_retryable());
    }

    #[test]
    fn test_token_limit_fields() {
        let err = EngineError::TokenLimitExceeded {
            limit: 100,
            actual: 150,
        };
        assert_eq!(err.to_string(), "token limit exceeded: limit 100, actual 150");
    }
}
