// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use ledit_model::ToolCall;

/// Events emitted by the agent while processing one user query.
/// Consumers (CLI output, future UIs) subscribe to these to drive display;
/// dropping the receiver never stalls the loop.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model.
    TextDelta(String),
    /// A complete assistant text turn.
    TextComplete(String),
    /// The model requested a tool call.
    ToolCallStarted(ToolCall),
    /// A tool call finished.
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Running totals after a response was attributed.
    TokenUsage {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
        total_cost: f64,
        cached_tokens: u64,
    },
    /// The pruner crossed the 80% budget threshold (emitted once).
    ContextWarning { estimated_tokens: usize, budget: usize },
    /// A completion/continuation reminder was injected.
    ReminderInjected { count: u32, escalated: bool },
    /// Streamed output line from a sub-agent (prefixed with the task id for
    /// parallel batches).
    SubagentOutput(String),
    /// The agent finished processing the current user query.
    TurnComplete,
}
