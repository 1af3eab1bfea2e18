// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use ledit_config::Config;
use ledit_model::{ChatRequest, LlmClient, Message, Role, ToolCall};
use ledit_tools::{
    AgentOps, AgentRole, DispatchContext, SecurityGate, ToolOutcome, ToolRegistry,
};

use crate::{
    changes::ChangeTracker,
    circuit::CircuitBreaker,
    events::AgentEvent,
    fallback, optimize,
    prune::Pruner,
    run_state::{self, RunState},
    signal,
    usage::UsageTotals,
    watchdog::Watchdog,
};

/// Out-of-band input observed between iterations.
#[derive(Debug, Clone)]
pub enum Interrupt {
    /// Additional user text appended as a new user turn.
    Inject(String),
    /// Stop now; the driver returns the last assistant text.
    Stop,
}

/// The core agent.  Owns the conversation and drives the model ↔ tool loop.
pub struct Agent {
    client: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    gate: Arc<SecurityGate>,
    config: Arc<Config>,
    role: AgentRole,
    system_prompt: String,

    /// The conversation.  The sequence IS the agent's state: entries are
    /// appended, and older entries are only ever rewritten in place by the
    /// optimizer, never removed.
    pub messages: Vec<Message>,

    totals: Arc<Mutex<UsageTotals>>,
    changes: Arc<Mutex<ChangeTracker>>,
    actions: Arc<Mutex<Vec<String>>>,
    shell_history: Arc<Mutex<Vec<String>>>,
    ops: Arc<dyn AgentOps>,

    pruner: Pruner,
    circuit: CircuitBreaker,
    watchdog: Watchdog,
    current_iteration: u32,
    intent: String,
    workdir: PathBuf,
    interactive: bool,

    interrupt_tx: mpsc::UnboundedSender<Interrupt>,
    interrupt_rx: mpsc::UnboundedReceiver<Interrupt>,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
    stats_callback: Option<Arc<dyn Fn(UsageTotals) + Send + Sync>>,
}

impl Agent {
    pub fn new(
        client: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        gate: Arc<SecurityGate>,
        config: Arc<Config>,
        role: AgentRole,
        system_prompt: impl Into<String>,
        workdir: PathBuf,
    ) -> Self {
        let totals = Arc::new(Mutex::new(UsageTotals::default()));
        let changes = Arc::new(Mutex::new(ChangeTracker::new()));
        let actions = Arc::new(Mutex::new(Vec::new()));
        let shell_history = Arc::new(Mutex::new(Vec::new()));
        let interactive = config.security.interactive && role == AgentRole::Primary;
        let ops: Arc<dyn AgentOps> = Arc::new(AgentOpsBridge {
            changes: Arc::clone(&changes),
            actions: Arc::clone(&actions),
            shell_history: Arc::clone(&shell_history),
            workdir: workdir.clone(),
            interactive,
        });
        let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
        let threshold = config.agent.circuit_breaker_threshold;
        Self {
            client,
            registry,
            gate,
            config,
            role,
            system_prompt: system_prompt.into(),
            messages: Vec::new(),
            totals,
            changes,
            actions,
            shell_history,
            ops,
            pruner: Pruner::new(),
            circuit: CircuitBreaker::new(threshold),
            watchdog: Watchdog::from_env(),
            current_iteration: 0,
            intent: String::new(),
            workdir,
            interactive,
            interrupt_tx,
            interrupt_rx,
            events: None,
            stats_callback: None,
        }
    }

    /// Handle for delivering interrupts / injected input from another task.
    pub fn interrupt_handle(&self) -> mpsc::UnboundedSender<Interrupt> {
        self.interrupt_tx.clone()
    }

    /// Replace the tool registry.  Used once at startup to swap in the full
    /// catalog after the sub-agent tools have been wired to this agent's
    /// accounting handles; the registry stays immutable afterwards.
    pub fn set_registry(&mut self, registry: Arc<ToolRegistry>) {
        self.registry = registry;
    }

    /// Install an event sink.  Dropping the receiver never stalls the loop.
    pub fn set_event_sink(&mut self, tx: mpsc::UnboundedSender<AgentEvent>) {
        self.events = Some(tx);
    }

    /// Callback invoked with the running totals after every attribution.
    pub fn set_stats_callback(&mut self, cb: Arc<dyn Fn(UsageTotals) + Send + Sync>) {
        self.stats_callback = Some(cb);
    }

    pub fn totals(&self) -> UsageTotals {
        *self.totals.lock().unwrap()
    }

    /// Shared handles for wiring the sub-agent orchestrator into the same
    /// accounting and session-action streams.
    pub fn totals_handle(&self) -> Arc<Mutex<UsageTotals>> {
        Arc::clone(&self.totals)
    }

    pub fn actions_handle(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.actions)
    }

    pub fn change_tracker(&self) -> Arc<Mutex<ChangeTracker>> {
        Arc::clone(&self.changes)
    }

    pub fn current_iteration(&self) -> u32 {
        self.current_iteration
    }

    pub fn reset_circuit_breaker(&mut self) {
        self.circuit.reset_all();
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    // ── The main loop ─────────────────────────────────────────────────────────

    /// Process one user query to completion: iterate model calls and tool
    /// dispatches until the model signals `[[TASK_COMPLETE]]`, an interrupt
    /// stops the run, or the iteration cap trips.
    pub async fn process_query(&mut self, user_text: &str) -> anyhow::Result<String> {
        self.intent = user_text.to_string();
        self.changes.lock().unwrap().enable(user_text);
        self.messages.push(Message::user(user_text));

        let max_iterations = self.config.agent.max_iterations;
        let mut reminders = 0u32;
        let mut last_text = String::new();

        for iteration in 0..max_iterations {
            self.current_iteration = iteration;

            // a. Interrupt / injected-input channel.
            match self.interrupt_rx.try_recv() {
                Ok(Interrupt::Stop) => {
                    debug!("stop interrupt observed; ending turn");
                    self.finish_turn();
                    return Ok(last_text);
                }
                Ok(Interrupt::Inject(text)) => {
                    self.messages.push(Message::user(text));
                }
                Err(_) => {}
            }

            // b. Optimizer rewrite, then system prompt, then budget
            // enforcement.  The rewrite mutates the stored conversation;
            // pruning only shapes the outgoing request.
            optimize::optimize(&mut self.messages);
            let mut request_messages = Vec::with_capacity(self.messages.len() + 1);
            request_messages.push(Message::system(self.system_prompt.clone()));
            request_messages.extend(self.messages.iter().cloned());
            let report = self.pruner.enforce(
                &mut request_messages,
                self.config.agent.max_context_tokens,
                self.client.model_name(),
            );
            if report.warning {
                self.emit(AgentEvent::ContextWarning {
                    estimated_tokens: report.estimated_before,
                    budget: self.config.agent.max_context_tokens,
                });
            }

            // c/d. Send to the model.  Retry policy lives in the client; a
            // hard failure here ends the turn with the captured error.
            let req = ChatRequest {
                messages: request_messages,
                tools: self.registry.schemas(),
                reasoning_hint: self.config.model.reasoning_effort.clone(),
                stream: self.config.agent.streaming,
            };
            let response = self
                .watchdog
                .watch("llm_request", self.client.send_chat_request(req))
                .await
                .context("LLM request failed")?;

            // e. Usage and cost attribution.
            {
                let mut totals = self.totals.lock().unwrap();
                totals.attribute(&response.usage);
                let snapshot = *totals;
                drop(totals);
                if let Some(cb) = &self.stats_callback {
                    cb(snapshot);
                }
                self.emit(AgentEvent::TokenUsage {
                    prompt_tokens: snapshot.prompt_tokens,
                    completion_tokens: snapshot.completion_tokens,
                    total_tokens: snapshot.total_tokens,
                    total_cost: snapshot.total_cost,
                    cached_tokens: snapshot.cached_tokens,
                });
            }

            let message = response.message().cloned().unwrap_or_default();
            let mut content = message.content;
            let mut tool_calls = message.tool_calls;

            // g. No structured calls — try to recover calls embedded in
            // prose and rewrite the content to the cleaned remainder.
            if tool_calls.is_empty() {
                if let Some(extraction) = fallback::extract_tool_calls(&content) {
                    tool_calls = extraction.calls;
                    content = extraction.cleaned;
                }
            }

            // f. Append the assistant turn (reasoning preserved verbatim).
            let previous_assistant = self
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant && !m.content.is_empty())
                .map(|m| m.content.clone());
            let mut assistant = Message::assistant_with_calls(content.clone(), tool_calls.clone());
            assistant.reasoning_content = message.reasoning_content.clone();
            self.messages.push(assistant);
            if !content.is_empty() {
                self.emit(AgentEvent::TextComplete(content.clone()));
            }

            // h. Tool calls present: gate, dispatch, append results, loop.
            if !tool_calls.is_empty() {
                self.dispatch_tool_calls(&tool_calls).await;
                continue;
            }

            // i. No tool calls: classify the text turn.
            last_text = content.clone();

            if signal::is_blank(&content) {
                reminders += 1;
                self.inject_reminder(reminders, "Your last reply was empty.");
                continue;
            }

            let repetitive = signal::is_repetitive(&content, previous_assistant.as_deref());
            if let Some(clean) = signal::strip_completion_signal(&content) {
                self.finish_turn();
                self.emit(AgentEvent::TurnComplete);
                return Ok(clean);
            }
            if repetitive {
                let guidance = self
                    .circuit
                    .record("repetitive_content", "assistant_text")
                    .unwrap_or_else(|| {
                        "You appear to be repeating yourself without making progress."
                            .to_string()
                    });
                reminders += 1;
                self.inject_reminder(reminders, &guidance);
                continue;
            }

            reminders += 1;
            self.inject_reminder(reminders, "");
        }

        // Iteration cap reached: wrap up rather than erroring.
        self.finish_turn();
        self.emit(AgentEvent::TurnComplete);
        Ok(format!(
            "{last_text}\n\n[Reached the maximum of {max_iterations} iterations without \
             an explicit completion signal.]"
        ))
    }

    /// Inject the continuation/completion reminder, escalating once the
    /// configured cap is exceeded.  The counter keeps growing past the cap.
    fn inject_reminder(&mut self, count: u32, preamble: &str) {
        let cap = self.config.agent.reminder_cap;
        let escalated = count > cap;
        let text = if escalated {
            format!(
                "{preamble} REMINDER {count}: you have now replied {count} times without \
                 tool calls or a completion signal. Either perform the remaining work \
                 with tool calls NOW, or — if everything is genuinely done — reply with \
                 [[TASK_COMPLETE]] and a final summary."
            )
        } else {
            format!(
                "{preamble} If the task is complete, reply with [[TASK_COMPLETE]]. \
                 Otherwise continue with the next step or tool call."
            )
        };
        self.messages.push(Message::user(text.trim().to_string()));
        self.emit(AgentEvent::ReminderInjected { count, escalated });
    }

    /// Gate and execute one batch of tool calls, appending a `tool` message
    /// per call in the order dictated by the assistant's `tool_calls` array.
    async fn dispatch_tool_calls(&mut self, tool_calls: &[ToolCall]) {
        // Circuit-breaker pass first (needs &mut self): tripped calls get a
        // synthetic guidance result instead of a dispatch.
        let mut pre: Vec<Option<String>> = Vec::with_capacity(tool_calls.len());
        for tc in tool_calls {
            let target = primary_target(tc);
            pre.push(self.circuit.record(&tc.function.name, &target));
        }

        let parallel = tool_calls.len() > 1
            && tool_calls
                .iter()
                .all(|tc| self.registry.is_read_only(&tc.function.name));

        for tc in tool_calls {
            self.emit(AgentEvent::ToolCallStarted(tc.clone()));
        }

        let outcomes: Vec<ToolOutcome> = if parallel {
            // Read-only batch: execute concurrently, collect into slots
            // indexed by call position so order is preserved independent of
            // completion time.
            let mut handles = Vec::with_capacity(tool_calls.len());
            for (i, tc) in tool_calls.iter().enumerate() {
                if pre[i].is_some() {
                    handles.push(None);
                    continue;
                }
                let registry = Arc::clone(&self.registry);
                let ctx = self.dispatch_context();
                let call = resolve_call(tc);
                handles.push(Some(tokio::spawn(async move {
                    match call {
                        Ok(call) => registry.dispatch(&call, &ctx).await,
                        Err(msg) => ToolOutcome::Validation(msg),
                    }
                })));
            }
            let mut slots: Vec<ToolOutcome> = Vec::with_capacity(tool_calls.len());
            for (i, handle) in handles.into_iter().enumerate() {
                let outcome = match handle {
                    None => ToolOutcome::Handler(pre[i].clone().unwrap_or_default()),
                    Some(h) => match h.await {
                        Ok(outcome) => outcome,
                        Err(e) => ToolOutcome::Handler(format!("tool task panicked: {e}")),
                    },
                };
                slots.push(outcome);
            }
            slots
        } else {
            let mut outcomes = Vec::with_capacity(tool_calls.len());
            for (i, tc) in tool_calls.iter().enumerate() {
                let outcome = if let Some(guidance) = &pre[i] {
                    ToolOutcome::Handler(guidance.clone())
                } else {
                    match resolve_call(tc) {
                        Ok(call) => {
                            let ctx = self.dispatch_context();
                            self.watchdog
                                .watch(&tc.function.name, self.registry.dispatch(&call, &ctx))
                                .await
                        }
                        Err(msg) => ToolOutcome::Validation(msg),
                    }
                };
                outcomes.push(outcome);
            }
            outcomes
        };

        for (tc, outcome) in tool_calls.iter().zip(outcomes) {
            let is_error = !outcome.is_ok();
            if is_error {
                warn!(tool = %tc.function.name, id = %tc.id, "tool call failed");
            }
            let content = outcome.into_message_content();
            self.emit(AgentEvent::ToolCallFinished {
                call_id: tc.id.clone(),
                tool_name: tc.function.name.clone(),
                output: content.clone(),
                is_error,
            });
            self.messages.push(Message::tool_result(&tc.id, content));
        }
    }

    fn dispatch_context(&self) -> DispatchContext {
        DispatchContext {
            ops: Arc::clone(&self.ops),
            role: self.role,
            gate: Arc::clone(&self.gate),
            interactive: self.interactive,
        }
    }

    /// Commit the turn's revision, if any mutation opened one.
    fn finish_turn(&mut self) {
        if let Some(id) = self.changes.lock().unwrap().commit() {
            debug!(revision = %id, "turn revision committed");
        }
    }

    /// Snapshot the resumable subset of state to `.ledit/run_state.json`.
    pub fn write_checkpoint(&self) {
        let totals = self.totals();
        let state = RunState {
            intent: self.intent.clone(),
            current_iteration: self.current_iteration,
            max_iterations: self.config.agent.max_iterations,
            total_tokens: totals.total_tokens,
            total_cost: totals.total_cost,
            executed_operations: self.actions.lock().unwrap().clone(),
            errors: Vec::new(),
            validation_results: Default::default(),
            updated_at: None,
        };
        run_state::save(&self.workdir, &state);
    }

    pub fn shell_history(&self) -> Vec<String> {
        self.shell_history.lock().unwrap().clone()
    }
}

/// Parse a model-level tool call into the registry's invocation shape.
fn resolve_call(tc: &ToolCall) -> Result<ledit_tools::ToolCall, String> {
    let args: serde_json::Value = if tc.function.arguments.trim().is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(&tc.function.arguments)
            .map_err(|e| format!("invalid JSON arguments for {}: {e}", tc.function.name))?
    };
    Ok(ledit_tools::ToolCall {
        id: tc.id.clone(),
        name: tc.function.name.clone(),
        args,
    })
}

/// The argument that identifies what a call is acting on, for circuit
/// breaker keying.
fn primary_target(tc: &ToolCall) -> String {
    let args: serde_json::Value =
        serde_json::from_str(&tc.function.arguments).unwrap_or(serde_json::Value::Null);
    for key in ["path", "file_path", "command", "cmd", "url", "pattern", "prompt"] {
        if let Some(v) = args.get(key).and_then(serde_json::Value::as_str) {
            return v.to_string();
        }
    }
    let raw = tc.function.arguments.trim();
    raw.chars().take(80).collect()
}

// ─── AgentOps bridge ──────────────────────────────────────────────────────────

/// Capability implementation handed to tool handlers.  Holds only the
/// shared pieces of agent state the tools are allowed to touch.
struct AgentOpsBridge {
    changes: Arc<Mutex<ChangeTracker>>,
    actions: Arc<Mutex<Vec<String>>>,
    shell_history: Arc<Mutex<Vec<String>>>,
    workdir: PathBuf,
    interactive: bool,
}

#[async_trait]
impl AgentOps for AgentOpsBridge {
    fn log_action(&self, action: &str) {
        self.actions.lock().unwrap().push(action.to_string());
    }

    fn track_file_write(&self, path: &str, old_content: Option<String>, new_content: &str) {
        self.changes
            .lock()
            .unwrap()
            .record_write(path, old_content, new_content);
    }

    fn track_file_edit(&self, path: &str, old_content: &str, new_content: &str) {
        self.changes
            .lock()
            .unwrap()
            .record_edit(path, old_content, new_content);
    }

    fn record_file_read(&self, path: &str, _content: &str) {
        self.actions.lock().unwrap().push(format!("Read: {path}"));
    }

    fn record_shell_command(&self, command: &str, _output: &str) {
        self.shell_history.lock().unwrap().push(command.to_string());
    }

    fn workdir(&self) -> PathBuf {
        self.workdir.clone()
    }

    async fn confirm(&self, prompt: &str) -> bool {
        if !self.interactive {
            return false;
        }
        // CI and scripted runs approve without a prompt when the user set
        // LEDIT_SKIP_PROMPT; otherwise ask on the terminal.
        if std::env::var("LEDIT_SKIP_PROMPT").map(|v| v == "1").unwrap_or(false) {
            return true;
        }
        eprint!("{prompt} [y/N] ");
        let mut line = String::new();
        let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
        use tokio::io::AsyncBufReadExt;
        if reader.read_line(&mut line).await.is_err() {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &str) -> ToolCall {
        ToolCall::new("id1", name, args)
    }

    #[test]
    fn primary_target_prefers_path() {
        let tc = call("read_file", r#"{"path":"src/a.rs","limit":5}"#);
        assert_eq!(primary_target(&tc), "src/a.rs");
    }

    #[test]
    fn primary_target_uses_command_for_shell() {
        let tc = call("shell_command", r#"{"command":"cargo test"}"#);
        assert_eq!(primary_target(&tc), "cargo test");
    }

    #[test]
    fn primary_target_falls_back_to_raw_arguments() {
        let tc = call("custom", r#"{"other":1}"#);
        assert_eq!(primary_target(&tc), r#"{"other":1}"#);
    }

    #[test]
    fn resolve_call_parses_arguments() {
        let tc = call("read_file", r#"{"path":"x"}"#);
        let resolved = resolve_call(&tc).unwrap();
        assert_eq!(resolved.name, "read_file");
        assert_eq!(resolved.args["path"], "x");
    }

    #[test]
    fn resolve_call_empty_arguments_become_object() {
        let tc = call("list_dir", "");
        let resolved = resolve_call(&tc).unwrap();
        assert!(resolved.args.is_object());
    }

    #[test]
    fn resolve_call_invalid_json_is_error() {
        let tc = call("read_file", "{not json");
        assert!(resolve_call(&tc).is_err());
    }
}
