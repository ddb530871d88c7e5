// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! LLM workflow engine CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use llm_workflow_core::dag::WorkflowDag;
use llm_workflow_core::workflow::Workflow;
use llm_workflow_providers::{AnthropicProvider, OllamaProvider, OpenAiProvider};
use llm_workflow_sdk::{Engine, RunOptions};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "llm-workflow")]
#[command(version, about = "LLM Workflow Engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition
    Validate {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Run a workflow
    Run {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: String,

        /// Input JSON string or file
        #[arg(short, long)]
        input: Option<String>,

        /// Maximum concurrent steps
        #[arg(long, default_value = "1")]
        max_concurrency: usize,

        /// Per-run token limit (0 = unlimited)
        #[arg(long, default_value = "0")]
        token_limit: u64,

        /// Directory for run checkpoints
        #[arg(long)]
        checkpoint_dir: Option<String>,
    },

    /// List interrupted runs with checkpoints on disk
    Checkpoints {
        /// Directory for run checkpoints
        #[arg(long, default_value = ".llm-workflow/checkpoints")]
        checkpoint_dir: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("llm_workflow={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Run {
            file,
            input,
            max_concurrency,
            token_limit,
            checkpoint_dir,
        } => {
            run_workflow(
                &file,
                input.as_deref(),
                max_concurrency,
                token_limit,
                checkpoint_dir.as_deref(),
            )
            .await
        }
        Commands::Checkpoints { checkpoint_dir } => list_checkpoints(&checkpoint_dir),
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn validate_workflow(file_path: &str) -> Result<()> {
    info!("Validating workflow: {}", file_path);
    println!("{} {}", "Validating workflow:".cyan().bold(), file_path);

    let content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read workflow file: {}", file_path))?;

    let workflow = Workflow::from_yaml(&content)
        .with_context(|| format!("Failed to parse workflow YAML: {}", file_path))?;

    info!("Parsed workflow: {} v{}", workflow.name, workflow.version);

    workflow
        .validate()
        .with_context(|| "Workflow validation failed")?;

    // Build the DAG to check for cycles.
    let _dag = WorkflowDag::from_workflow(&workflow)
        .with_context(|| "Failed to build workflow DAG (possible cycle detected)")?;

    println!("{}", "✓ Workflow is valid".green().bold());
    println!("  Name: {}", workflow.name);
    println!("  Version: {}", workflow.version);
    println!("  Steps: {}", workflow.steps.len());

    Ok(())
}

async fn run_workflow(
    file_path: &str,
    input: Option<&str>,
    max_concurrency: usize,
    token_limit: u64,
    checkpoint_dir: Option<&str>,
) -> Result<()> {
    info!("Running workflow: {}", file_path);
    println!("{} {}", "Running workflow:".cyan().bold(), file_path);

    let inputs = if let Some(input_str) = input {
        parse_input(input_str)?
    } else {
        HashMap::new()
    };

    let mut builder = Engine::builder();

    // Register whichever providers the environment supplies.
    let mut registered = 0;
    if let Ok(openai) = OpenAiProvider::from_env() {
        info!("Registered OpenAI provider");
        builder = builder.with_provider("openai", Arc::new(openai));
        registered += 1;
    }
    if let Ok(anthropic) = AnthropicProvider::from_env() {
        info!("Registered Anthropic provider");
        builder = builder.with_provider("anthropic", Arc::new(anthropic));
        registered += 1;
    }
    if std::env::var("OLLAMA_HOST").is_ok() {
        info!("Registered Ollama provider");
        builder = builder.with_provider("ollama", Arc::new(OllamaProvider::from_env()));
        registered += 1;
    }
    if registered == 0 {
        anyhow::bail!(
            "No LLM providers available. Set OPENAI_API_KEY, ANTHROPIC_API_KEY or OLLAMA_HOST."
        );
    }

    if let Some(dir) = checkpoint_dir {
        builder = builder.with_checkpoint_dir(dir);
    }

    let engine = builder.build().context("Failed to build engine")?;

    // Ctrl-C cancels the run; partial results are still reported.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{}", "Cancelling run...".yellow());
            signal_cancel.cancel();
        }
    });

    println!("{}", "Executing workflow...".cyan());

    let options = RunOptions {
        token_limit,
        max_parallel_steps: max_concurrency,
        ..Default::default()
    };
    let run = engine
        .run_file(cancel, file_path, inputs, &options)
        .await
        .with_context(|| "Workflow execution failed")?;

    match run.status {
        llm_workflow_core::run::RunStatus::Completed => {
            println!("{}", "✓ Workflow completed successfully".green().bold());
        }
        status => {
            println!("{} {:?}", "✗ Workflow finished as".red().bold(), status);
            if let Some(error) = &run.error {
                println!("  {}", error);
            }
        }
    }

    println!("\n{}", "Results:".cyan().bold());
    println!(
        "{}",
        serde_json::to_string_pretty(&run.output).unwrap_or_else(|_| format!("{:?}", run.output))
    );
    println!(
        "\n{} {} total tokens across {} steps",
        "Usage:".cyan().bold(),
        run.usage.totals.total_tokens,
        run.step_results.len()
    );

    if run.status != llm_workflow_core::run::RunStatus::Completed {
        std::process::exit(1);
    }

    Ok(())
}

fn list_checkpoints(checkpoint_dir: &str) -> Result<()> {
    let store = llm_workflow_core::checkpoint::CheckpointStore::new(checkpoint_dir)
        .with_context(|| format!("Failed to open checkpoint directory: {}", checkpoint_dir))?;

    let interrupted = store
        .list_interrupted()
        .context("Failed to list checkpoints")?;

    if interrupted.is_empty() {
        println!("{}", "No interrupted runs.".green());
        return Ok(());
    }

    println!(
        "{} {} interrupted run(s):",
        "Found".cyan().bold(),
        interrupted.len()
    );
    for checkpoint in interrupted {
        println!(
            "  {} {} (workflow {}, last step '{}' at index {}, saved {})",
            "●".yellow(),
            checkpoint.run_id,
            checkpoint.workflow_id.cyan(),
            checkpoint.step_id,
            checkpoint.step_index,
            checkpoint.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    Ok(())
}

fn parse_input(input_str: &str) -> Result<HashMap<String, Value>> {
    // A file path or an inline JSON object.
    if Path::new(input_str).exists() {
        let content = fs::read_to_string(input_str)
            .with_context(|| format!("Failed to read input file: {}", input_str))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse input JSON from file: {}", input_str))
    } else {
        serde_json::from_str(input_str).with_context(|| "Failed to parse input JSON string")
    }
}
