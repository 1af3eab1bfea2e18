// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::filter::EnvFilter;

use cli::Cli;
use ledit_config::ModelConfig;
use ledit_core::{
    run_parallel_subagents_config, run_subagent_config, Agent, AgentEvent, Interrupt,
    SubagentOrchestrator,
};
use ledit_model::{EchoClient, LlmClient, OpenAiClient};
use ledit_tools::{
    install_builtin, AgentRole, LlmRiskValidator, RiskValidator, SecurityGate, ToolRegistry,
};

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are ledit, an autonomous coding agent operating on the user's workspace. \
Work through the task with the provided tools: read before you edit, prefer \
small verifiable steps, and run commands to check your work. When the task \
is fully complete, reply with [[TASK_COMPLETE]] followed by a short summary \
of what was done.";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

/// Suppress ANSI color in CI logs; default to warn-level output unless the
/// user opts into debugging via DEBUG or RUST_LOG.
fn init_logging() {
    let debug = std::env::var("DEBUG")
        .map(|v| !v.is_empty() && v != "0")
        .unwrap_or(false);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "warn" }));
    let plain = std::env::var("CI").is_ok() || std::env::var("GITHUB_ACTIONS").is_ok();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!plain)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let is_subagent = std::env::var("LEDIT_SUBAGENT").map(|v| v == "1").unwrap_or(false);
    let role = if is_subagent {
        AgentRole::Subagent
    } else {
        AgentRole::Primary
    };

    let mut config = ledit_config::load(cli.config.as_deref())?;
    if cli.unsafe_mode {
        config.security.unsafe_mode = true;
    }
    // LEDIT_FROM_AGENT marks a process launched by another agent even when
    // it is not a sub-agent proper: file-security questions must not prompt.
    let from_agent = std::env::var("LEDIT_FROM_AGENT").map(|v| v == "1").unwrap_or(false);
    if is_subagent || from_agent {
        config.security.interactive = false;
    }
    if let Some(max) = cli.max_iterations {
        config.agent.max_iterations = max;
    }

    let mut model_cfg = config.resolve_model(cli.provider.as_deref(), cli.persona.as_deref());
    if let Some(provider) = &cli.provider {
        if !config.providers.contains_key(provider) {
            model_cfg.provider = provider.clone();
        }
    }
    if let Some(model) = &cli.model {
        model_cfg.name = model.clone();
    }
    let config = Arc::new(config);

    let workdir = match &cli.workdir {
        Some(w) => w.clone(),
        None => std::env::current_dir().context("resolving working directory")?,
    };

    let prompt = match &cli.prompt {
        Some(p) => p.clone(),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading prompt from stdin")?;
            buf.trim().to_string()
        }
    };
    if prompt.is_empty() {
        anyhow::bail!("no prompt given (use --prompt or pipe text on stdin)");
    }

    let client = build_client(&model_cfg)?;
    let validator: Option<Arc<dyn RiskValidator>> = if config.security.llm_validation {
        Some(Arc::new(LlmRiskValidator::new(Arc::clone(&client))))
    } else {
        None
    };
    let gate = Arc::new(SecurityGate::new(config.security.clone(), validator));

    let system_prompt = cli
        .system_prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

    let mut agent = Agent::new(
        client,
        Arc::new(ToolRegistry::new()),
        gate,
        Arc::clone(&config),
        role,
        system_prompt,
        workdir.clone(),
    );

    // The full catalog needs the agent's accounting handles for sub-agent
    // cost attribution, so it is assembled after the agent and swapped in
    // before the first query.
    let orchestrator = Arc::new(
        SubagentOrchestrator::new(
            Arc::clone(&config),
            workdir.clone(),
            agent.totals_handle(),
            agent.actions_handle(),
        )
        .with_stream(Arc::new(|line: &str| println!("{line}"))),
    );
    let mut registry = ToolRegistry::new();
    install_builtin(&mut registry, config.agent.shell_timeout_secs);
    registry.register(run_subagent_config(Arc::clone(&orchestrator)));
    registry.register(run_parallel_subagents_config(orchestrator));
    agent.set_registry(registry.install_global());

    // Progress stream: tool lifecycle lines on stdout so a parent process
    // (or the user) can follow along; the sub-agent summary extractor keys
    // off the anchored prefixes.
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    agent.set_event_sink(tx);
    let printer = tokio::spawn(print_events(rx));

    // Token budget: enforced inside this process by stopping the loop at
    // the next iteration boundary once totals cross the cap.
    let budget = cli.token_budget.or(config.subagent.token_budget);
    let budget_exceeded = Arc::new(AtomicBool::new(false));
    if let Some(cap) = budget {
        let flag = Arc::clone(&budget_exceeded);
        let stop = agent.interrupt_handle();
        agent.set_stats_callback(Arc::new(move |totals| {
            if totals.total_tokens > cap && !flag.swap(true, Ordering::SeqCst) {
                tracing::warn!(total = totals.total_tokens, cap, "token budget exceeded");
                let _ = stop.send(Interrupt::Stop);
            }
        }));
    }

    let result = agent.process_query(&prompt).await;
    let totals = agent.totals();
    agent.write_checkpoint();
    drop(agent);
    let _ = printer.await;

    let exceeded = budget_exceeded.load(Ordering::SeqCst);
    match result {
        Ok(text) => println!("{text}"),
        Err(e) => {
            eprintln!("error: {e:#}");
            if is_subagent {
                print_metrics(&totals);
            }
            return Ok(1);
        }
    }

    if is_subagent {
        if exceeded {
            println!(
                "SUBAGENT_BUDGET_EXCEEDED: tokens={} budget={}",
                totals.total_tokens,
                budget.unwrap_or(0)
            );
        }
        print_metrics(&totals);
        if exceeded {
            return Ok(2);
        }
    }
    Ok(0)
}

fn print_metrics(totals: &ledit_core::UsageTotals) {
    println!(
        "SUBAGENT_METRICS: total_tokens={} prompt_tokens={} completion_tokens={} \
         total_cost={:.6} cached_tokens={}",
        totals.total_tokens,
        totals.prompt_tokens,
        totals.completion_tokens,
        totals.total_cost,
        totals.cached_tokens
    );
}

fn build_client(model_cfg: &ModelConfig) -> anyhow::Result<Arc<dyn LlmClient>> {
    match model_cfg.provider.as_str() {
        "mock" => Ok(Arc::new(EchoClient)),
        // Everything else speaks the OpenAI-compatible chat protocol; the
        // base URL selects the actual backend.
        _ => {
            let api_key = model_cfg
                .api_key_env
                .as_deref()
                .and_then(|name| std::env::var(name).ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
            let mut client = OpenAiClient::new(&model_cfg.name, api_key)
                .with_temperature(model_cfg.temperature)
                .with_max_tokens(model_cfg.max_tokens);
            if let Some(base) = &model_cfg.base_url {
                client = client.with_base_url(base);
            }
            Ok(Arc::new(client))
        }
    }
}

/// Render agent events as the line protocol parents and users read.
async fn print_events(mut rx: tokio::sync::mpsc::UnboundedReceiver<AgentEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::ToolCallStarted(tc) => {
                if tc.function.name == "shell_command" {
                    if let Ok(args) =
                        serde_json::from_str::<serde_json::Value>(&tc.function.arguments)
                    {
                        if let Some(cmd) = args
                            .get("command")
                            .or_else(|| args.get("cmd"))
                            .and_then(|v| v.as_str())
                        {
                            println!("$ {cmd}");
                        }
                    }
                }
            }
            AgentEvent::ToolCallFinished {
                tool_name,
                output,
                is_error,
                ..
            } => {
                let first_line = output.lines().next().unwrap_or("");
                if is_error {
                    println!("Error: [{tool_name}] {first_line}");
                } else if matches!(tool_name.as_str(), "write_file" | "edit_file") {
                    // Handlers phrase these as "Created: …" / "Modified: …".
                    println!("{first_line}");
                }
            }
            AgentEvent::ContextWarning {
                estimated_tokens,
                budget,
            } => {
                eprintln!("warning: context usage at {estimated_tokens} of {budget} tokens");
            }
            _ => {}
        }
    }
}
