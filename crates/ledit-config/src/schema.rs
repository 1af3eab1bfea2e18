// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be on unless explicitly disabled
/// need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub subagent: SubagentConfig,
    /// Named provider configurations.
    ///
    /// Define custom endpoints or additional accounts here and reference
    /// them with `--provider <key>`:
    ///
    /// ```yaml
    /// providers:
    ///   local:
    ///     provider: openai
    ///     base_url: http://localhost:11434/v1
    ///     name: llama3.2
    /// ```
    #[serde(default)]
    pub providers: HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier, e.g. "openai" | "anthropic" | "mock".
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Base URL override.  Useful for local proxies or LiteLLM.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// Reasoning-effort hint forwarded with every request
    /// ("low" | "medium" | "high"); providers without reasoning ignore it.
    pub reasoning_effort: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            api_key_env: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            reasoning_effort: None,
        }
    }
}

fn default_max_iterations() -> u32 {
    100
}
fn default_max_context_tokens() -> usize {
    128_000
}
fn default_reminder_cap() -> u32 {
    3
}
fn default_circuit_breaker_threshold() -> u32 {
    3
}
fn default_shell_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upper bound on model↔tool round trips for a single user query.
    ///
    /// The historical default drifted between releases; 100 is the
    /// documented value and anything else must come from config or the
    /// `--max-iterations` flag.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Context window budget in tokens.  The pruner enforces this; the
    /// model's own limit may be larger.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// How many "please confirm completion" reminders are injected before
    /// escalating to the stronger wording.
    #[serde(default = "default_reminder_cap")]
    pub reminder_cap: u32,
    /// Repetitions of the same (action, target) pair before the circuit
    /// breaker trips and injects re-planning guidance.
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    /// Stream assistant text as it arrives instead of printing at turn end.
    #[serde(default = "default_true")]
    pub streaming: bool,
    /// Default timeout for the shell_command tool.
    #[serde(default = "default_shell_timeout_secs")]
    pub shell_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_context_tokens: default_max_context_tokens(),
            reminder_cap: default_reminder_cap(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            streaming: true,
            shell_timeout_secs: default_shell_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Skip normal validation (prompting, LLM risk classification).
    /// The critical-block predicate still applies — unsafe mode never
    /// bypasses it.
    #[serde(default)]
    pub unsafe_mode: bool,
    /// Classify risky tool calls with an LLM-backed validator before
    /// dispatch.  Validator failures fail open.
    #[serde(default)]
    pub llm_validation: bool,
    /// Whether a human can be prompted for confirmation.  False in CI and
    /// in sub-agent children; a needs-confirm decision then goes to the
    /// second-opinion path instead.
    #[serde(default = "default_true")]
    pub interactive: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            unsafe_mode: false,
            llm_validation: false,
            interactive: true,
        }
    }
}

fn default_max_parallel() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentConfig {
    /// Concurrent task cap for run_parallel_subagents.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Token budget enforced inside each child; `None` means unbounded.
    #[serde(default)]
    pub token_budget: Option<u64>,
    /// Persona-specific model overrides.  When a task names a persona that
    /// appears here, its model settings take precedence over `model`.
    #[serde(default)]
    pub persona_overrides: HashMap<String, ModelConfig>,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            token_budget: None,
            persona_overrides: HashMap::new(),
        }
    }
}

impl Config {
    /// Resolve the model configuration for an optional provider key and
    /// persona.  Precedence: persona override > named provider > default.
    pub fn resolve_model(&self, provider: Option<&str>, persona: Option<&str>) -> ModelConfig {
        if let Some(p) = persona {
            if let Some(m) = self.subagent.persona_overrides.get(p) {
                return m.clone();
            }
        }
        if let Some(key) = provider {
            if let Some(m) = self.providers.get(key) {
                return m.clone();
            }
        }
        self.model.clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
