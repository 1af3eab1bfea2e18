// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::capability::AgentOps;
use crate::outcome::ToolOutcome;
use crate::params::{parameters_schema, validate_args, ParameterConfig, ValidatedArgs};
use crate::security::{GateDecision, SecurityGate};

/// A single tool invocation, resolved from the model's structured call.
/// `args` is the parsed JSON argument object.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Which kind of process this registry is dispatching for.
///
/// Resolved once at startup (from `LEDIT_SUBAGENT`) and injected here so the
/// env var is not re-parsed at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Primary,
    Subagent,
}

/// Context threaded to handlers for one invocation.
pub struct HandlerCtx {
    pub ops: Arc<dyn AgentOps>,
    /// Set when the user explicitly approved an operation the file-security
    /// check refused on the first attempt.
    pub security_bypass: bool,
}

/// Trait every tool handler implements.  Errors become
/// [`ToolOutcome::Handler`]; handlers do not classify their own failures.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn run(&self, ctx: &HandlerCtx, args: &ValidatedArgs) -> anyhow::Result<String>;
}

/// Registry entry: the full data-driven description of one tool.
#[derive(Clone)]
pub struct ToolConfig {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Vec<ParameterConfig>,
    /// Member of the fixed parallel-dispatch allowlist.  Callers must not
    /// assume parallel safety for any tool where this is false.
    pub read_only: bool,
    pub handler: Arc<dyn ToolHandler>,
}

/// Everything `dispatch` needs besides the call itself.
pub struct DispatchContext {
    pub ops: Arc<dyn AgentOps>,
    pub role: AgentRole,
    pub gate: Arc<SecurityGate>,
    /// Whether a human can be prompted (primary interactive runs only).
    pub interactive: bool,
}

/// Prefix handlers use for path-containment refusals so the dispatcher can
/// recognize them post-hoc and offer the interactive bypass.
pub const FILE_SECURITY_PREFIX: &str = "file security: ";

const NESTED_SUBAGENT_ERROR: &str =
    "nested sub-agents are not permitted: this process is itself a sub-agent";

/// Central catalog of tools.  Populated once at process start and immutable
/// afterwards; shared read-only across agent instances.
pub struct ToolRegistry {
    tools: HashMap<&'static str, ToolConfig>,
}

static GLOBAL: OnceLock<Arc<ToolRegistry>> = OnceLock::new();

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, config: ToolConfig) {
        self.tools.insert(config.name, config);
    }

    /// Install this registry as the process-wide instance.  The first call
    /// wins; later calls return the already-installed registry.
    pub fn install_global(self) -> Arc<ToolRegistry> {
        GLOBAL.get_or_init(|| Arc::new(self)).clone()
    }

    /// The process-wide registry, if one has been installed.
    pub fn global() -> Option<Arc<ToolRegistry>> {
        GLOBAL.get().cloned()
    }

    pub fn get(&self, name: &str) -> Option<&ToolConfig> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.tools.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Tools that are safe to execute concurrently within one assistant turn.
    pub fn is_read_only(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.read_only).unwrap_or(false)
    }

    /// Produce the schema catalog handed to the model, sorted by name.
    pub fn schemas(&self) -> Vec<ledit_model::ToolSchema> {
        let mut schemas: Vec<ledit_model::ToolSchema> = self
            .tools
            .values()
            .map(|t| ledit_model::ToolSchema {
                name: t.name.to_string(),
                description: t.description.to_string(),
                parameters: parameters_schema(&t.parameters),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Dispatch one call through the full pipeline:
    /// lookup → recursion gate → security gate → validation → handler.
    pub async fn dispatch(&self, call: &ToolCall, ctx: &DispatchContext) -> ToolOutcome {
        let tool = match self.tools.get(call.name.as_str()) {
            Some(t) => t,
            None => return ToolOutcome::Validation(format!("unknown tool: {}", call.name)),
        };

        // Recursion gate: a sub-agent process must not spawn further
        // sub-agents, regardless of what the model asks for.
        if ctx.role == AgentRole::Subagent
            && matches!(call.name.as_str(), "run_subagent" | "run_parallel_subagents")
        {
            return ToolOutcome::Handler(NESTED_SUBAGENT_ERROR.to_string());
        }

        match ctx.gate.classify(&call.name, &call.args).await {
            GateDecision::Allow => {}
            GateDecision::CriticalBlock(reason) => {
                return ToolOutcome::CriticalBlock(reason);
            }
            GateDecision::Block(reason) => {
                return ToolOutcome::SecurityBlock(reason);
            }
            GateDecision::NeedsConfirm(reason) => {
                let prompt = format!("Allow '{}' ({reason})?", call.name);
                if !ctx.ops.confirm(&prompt).await {
                    return ToolOutcome::SecurityBlock(format!("declined by user: {reason}"));
                }
            }
        }

        let args = match validate_args(&tool.parameters, &call.args) {
            Ok(a) => a,
            Err(msg) => return ToolOutcome::Validation(msg),
        };

        debug!(tool = call.name.as_str(), id = call.id.as_str(), "dispatching tool");

        let handler_ctx = HandlerCtx {
            ops: Arc::clone(&ctx.ops),
            security_bypass: false,
        };
        match tool.handler.run(&handler_ctx, &args).await {
            Ok(output) => ToolOutcome::Ok(output),
            Err(e) => {
                let msg = e.to_string();
                if msg.starts_with(FILE_SECURITY_PREFIX) {
                    return self.handle_file_security(tool, ctx, &args, msg).await;
                }
                ToolOutcome::Handler(msg)
            }
        }
    }

    /// Post-hoc handling of a path-containment refusal.
    ///
    /// Sub-agent: propagate unchanged (the parent's orchestrator classifies
    /// it).  Primary interactive: ask the user; on approval re-dispatch with
    /// the bypass marker threaded through the handler context.
    async fn handle_file_security(
        &self,
        tool: &ToolConfig,
        ctx: &DispatchContext,
        args: &ValidatedArgs,
        msg: String,
    ) -> ToolOutcome {
        if ctx.role == AgentRole::Subagent || !ctx.interactive {
            return ToolOutcome::Handler(msg);
        }
        let prompt = format!("{msg}. Allow anyway?");
        if !ctx.ops.confirm(&prompt).await {
            return ToolOutcome::SecurityBlock(msg);
        }
        let bypass_ctx = HandlerCtx {
            ops: Arc::clone(&ctx.ops),
            security_bypass: true,
        };
        match tool.handler.run(&bypass_ctx, args).await {
            Ok(output) => ToolOutcome::Ok(output),
            Err(e) => ToolOutcome::Handler(e.to_string()),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::capability::NullOps;
    use crate::params::ParamType;

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn run(&self, _ctx: &HandlerCtx, args: &ValidatedArgs) -> anyhow::Result<String> {
            Ok(format!("echo:{}", args.str("text").unwrap_or("")))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl ToolHandler for FailingHandler {
        async fn run(&self, _ctx: &HandlerCtx, _args: &ValidatedArgs) -> anyhow::Result<String> {
            anyhow::bail!("boom")
        }
    }

    struct OutsideWorkdirHandler;

    #[async_trait]
    impl ToolHandler for OutsideWorkdirHandler {
        async fn run(&self, ctx: &HandlerCtx, _args: &ValidatedArgs) -> anyhow::Result<String> {
            if ctx.security_bypass {
                Ok("written with bypass".into())
            } else {
                anyhow::bail!("{}path '/outside' is outside the working directory", FILE_SECURITY_PREFIX)
            }
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(ToolConfig {
            name: "echo",
            description: "echoes text",
            parameters: vec![ParameterConfig::required("text", ParamType::String, "the text")],
            read_only: true,
            handler: Arc::new(EchoHandler),
        });
        reg.register(ToolConfig {
            name: "fail",
            description: "always fails",
            parameters: vec![],
            read_only: false,
            handler: Arc::new(FailingHandler),
        });
        reg.register(ToolConfig {
            name: "run_subagent",
            description: "stub",
            parameters: vec![],
            read_only: false,
            handler: Arc::new(EchoHandler),
        });
        reg.register(ToolConfig {
            name: "escape",
            description: "writes outside workdir",
            parameters: vec![],
            read_only: false,
            handler: Arc::new(OutsideWorkdirHandler),
        });
        reg
    }

    fn ctx(role: AgentRole) -> DispatchContext {
        DispatchContext {
            ops: Arc::new(NullOps),
            role,
            gate: Arc::new(SecurityGate::permissive()),
            interactive: false,
        }
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "t1".into(),
            name: name.into(),
            args,
        }
    }

    #[tokio::test]
    async fn dispatch_runs_handler_with_validated_args() {
        let reg = registry();
        let out = reg
            .dispatch(&call("echo", json!({"text": "hi"})), &ctx(AgentRole::Primary))
            .await;
        assert_eq!(out, ToolOutcome::Ok("echo:hi".into()));
    }

    #[tokio::test]
    async fn unknown_tool_is_validation_error() {
        let reg = registry();
        let out = reg
            .dispatch(&call("nope", json!({})), &ctx(AgentRole::Primary))
            .await;
        assert!(matches!(out, ToolOutcome::Validation(m) if m.contains("unknown tool")));
    }

    #[tokio::test]
    async fn missing_required_parameter_is_validation_error() {
        let reg = registry();
        let out = reg
            .dispatch(&call("echo", json!({})), &ctx(AgentRole::Primary))
            .await;
        assert!(matches!(out, ToolOutcome::Validation(m) if m.contains("'text'")));
    }

    #[tokio::test]
    async fn handler_failure_becomes_handler_outcome() {
        let reg = registry();
        let out = reg
            .dispatch(&call("fail", json!({})), &ctx(AgentRole::Primary))
            .await;
        assert!(matches!(out, ToolOutcome::Handler(m) if m.contains("boom")));
    }

    #[tokio::test]
    async fn subagent_cannot_dispatch_run_subagent() {
        let reg = registry();
        let out = reg
            .dispatch(&call("run_subagent", json!({})), &ctx(AgentRole::Subagent))
            .await;
        assert!(matches!(out, ToolOutcome::Handler(m) if m.contains("nested sub-agents")));
    }

    #[tokio::test]
    async fn primary_can_dispatch_run_subagent() {
        let reg = registry();
        let out = reg
            .dispatch(&call("run_subagent", json!({})), &ctx(AgentRole::Primary))
            .await;
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn critical_command_is_blocked_without_handler_invocation() {
        let mut reg = ToolRegistry::new();
        reg.register(ToolConfig {
            name: "shell_command",
            description: "shell",
            parameters: vec![ParameterConfig::required(
                "command",
                ParamType::String,
                "the command",
            )],
            read_only: false,
            handler: Arc::new(FailingHandler), // would fail loudly if invoked
        });
        let out = reg
            .dispatch(
                &call("shell_command", json!({"command": "rm -rf /usr"})),
                &ctx(AgentRole::Primary),
            )
            .await;
        assert!(matches!(out, ToolOutcome::CriticalBlock(_)), "{out:?}");
    }

    #[tokio::test]
    async fn file_security_error_propagates_unchanged_in_subagent() {
        let reg = registry();
        let out = reg
            .dispatch(&call("escape", json!({})), &ctx(AgentRole::Subagent))
            .await;
        assert!(
            matches!(out, ToolOutcome::Handler(ref m) if m.starts_with(FILE_SECURITY_PREFIX)),
            "{out:?}"
        );
    }

    #[tokio::test]
    async fn file_security_error_bypassed_after_interactive_approval() {
        let reg = registry();
        let ctx = DispatchContext {
            ops: Arc::new(NullOps), // NullOps approves everything
            role: AgentRole::Primary,
            gate: Arc::new(SecurityGate::permissive()),
            interactive: true,
        };
        let out = reg.dispatch(&call("escape", json!({})), &ctx).await;
        assert_eq!(out, ToolOutcome::Ok("written with bypass".into()));
    }

    #[test]
    fn read_only_classification() {
        let reg = registry();
        assert!(reg.is_read_only("echo"));
        assert!(!reg.is_read_only("fail"));
        assert!(!reg.is_read_only("unknown"));
    }

    #[test]
    fn schemas_are_sorted_and_complete() {
        let reg = registry();
        let schemas = reg.schemas();
        let names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
        assert!(names.contains(&"echo"));
    }
}
