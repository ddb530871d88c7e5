// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Built-in tools registered by the engine.

mod truncate;

pub use truncate::TruncateCodeTool;
