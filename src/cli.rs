// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::Parser;

/// An agentic code-editing CLI driven by an LLM tool-call loop.
///
/// With `--prompt` the agent runs one query to completion and prints the
/// final assistant text; without it the prompt is read from stdin.  When
/// spawned as a sub-agent (LEDIT_SUBAGENT=1) the same binary runs
/// non-interactively, enforces its token budget, and emits the reserved
/// `SUBAGENT_METRICS:` line before exiting.
#[derive(Debug, Parser)]
#[command(name = "ledit", version, about)]
pub struct Cli {
    /// The task prompt.  Read from stdin when omitted.
    #[arg(long)]
    pub prompt: Option<String>,

    /// Model name override.
    #[arg(long)]
    pub model: Option<String>,

    /// Provider key from the config `providers` table, or a builtin
    /// provider name ("openai", "mock").
    #[arg(long)]
    pub provider: Option<String>,

    /// Persona name; persona model overrides take precedence.
    #[arg(long)]
    pub persona: Option<String>,

    /// Replace the built-in system prompt.
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Explicit config file (merged over the discovered layers).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override agent.max_iterations.
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Token budget for this process (sub-agent runs).
    #[arg(long)]
    pub token_budget: Option<u64>,

    /// Skip normal security validation.  The critical-operation predicate
    /// still applies.
    #[arg(long = "unsafe")]
    pub unsafe_mode: bool,

    /// Working directory the agent operates in (default: cwd).
    #[arg(long)]
    pub workdir: Option<PathBuf>,
}
