// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! LLM provider integrations for the workflow engine.
//!
//! Each adapter implements [`llm_workflow_core::providers::LlmProvider`]
//! over a vendor's HTTP API, including tool-use round trips.

mod anthropic;
mod ollama;
mod openai;

pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

pub use llm_workflow_core::providers::{
    ChatRequest, ChatResponse, LlmProvider, Message, ProviderError, Role, StreamChunk, ToolCall,
    ToolSpec,
};
pub use llm_workflow_core::run::TokenUsage;
