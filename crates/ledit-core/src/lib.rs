// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod agent;
mod changes;
mod circuit;
mod events;
mod fallback;
mod optimize;
mod prune;
pub mod run_state;
mod signal;
mod subagent;
mod usage;
mod watchdog;

pub use agent::{Agent, Interrupt};
pub use changes::{ChangeTracker, FileChange, FileOp, Revision};
pub use circuit::{CircuitBreaker, CircuitBreakerAction};
pub use events::AgentEvent;
pub use fallback::{extract_tool_calls, Extraction};
pub use optimize::{
    aggressive_optimize, is_transient_command, optimize, FileReadRecord, ShellCommandRecord,
};
pub use prune::{estimate_tokens, PruneAction, PruneReport, Pruner};
pub use run_state::RunState;
pub use signal::{is_blank, is_repetitive, strip_completion_signal};
pub use subagent::{
    parse_metrics, run_parallel_subagents_config, run_subagent_config, strip_ansi,
    SubagentMetrics, SubagentOrchestrator, SubagentTask, BUDGET_MARKER, METRICS_PREFIX,
};
pub use usage::UsageTotals;
pub use watchdog::Watchdog;
