// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding SDK for running LLM workflows programmatically.
//!
//! The [`Engine`] façade wires providers, tools, event handlers and
//! persistence into one handle:
//!
//! ```no_run
//! use llm_workflow_sdk::{Engine, RunOptions};
//! use llm_workflow_providers::AnthropicProvider;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> llm_workflow_core::Result<()> {
//! let engine = Engine::builder()
//!     .with_provider("anthropic", Arc::new(AnthropicProvider::from_env()?))
//!     .build()?;
//!
//! let run = engine
//!     .run_file(
//!         CancellationToken::new(),
//!         "workflows/summarize.yaml",
//!         HashMap::new(),
//!         &RunOptions::default(),
//!     )
//!     .await?;
//! println!("{:?}", run.output);
//! # Ok(())
//! # }
//! ```

mod engine;
mod store;
pub mod tools;

pub use engine::{Engine, EngineBuilder, RunOptions};
pub use store::{RunFilter, RunStore};

pub use llm_workflow_core as core;
