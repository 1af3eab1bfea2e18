// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::params::{ParamType, ParameterConfig, ValidatedArgs};
use crate::registry::{HandlerCtx, ToolConfig, ToolHandler};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

/// Number of lines to keep from the head of oversized output.
const HEAD_LINES: usize = 100;

/// Number of lines to keep from the tail of oversized output.
/// Errors and summaries almost always appear at the end of build/test
/// output, so preserving the tail matters at least as much as the head.
const TAIL_LINES: usize = 100;

pub fn config(timeout_secs: u64) -> ToolConfig {
    ToolConfig {
        name: "shell_command",
        description: "Execute a bash one-liner and return stdout + stderr. \
                      Output is capped at ~20 KB; when larger, the first 100 \
                      and last 100 lines are preserved with an omission \
                      marker in between. Prefer non-interactive commands.",
        parameters: vec![
            ParameterConfig::required("command", ParamType::String, "The shell command to run")
                .with_aliases(&["cmd", "shell_command"]),
            ParameterConfig::optional(
                "workdir",
                ParamType::String,
                "Working directory (default: current directory)",
            ),
            ParameterConfig::optional(
                "timeout_secs",
                ParamType::Int,
                "Execution timeout in seconds",
            ),
        ],
        read_only: false,
        handler: Arc::new(ShellCommandHandler {
            default_timeout_secs: timeout_secs,
        }),
    }
}

struct ShellCommandHandler {
    default_timeout_secs: u64,
}

#[async_trait]
impl ToolHandler for ShellCommandHandler {
    async fn run(&self, ctx: &HandlerCtx, args: &ValidatedArgs) -> anyhow::Result<String> {
        let command = args.str("command").unwrap_or_default().to_string();
        let workdir = args.str("workdir").map(str::to_string);
        let timeout = args
            .int("timeout_secs")
            .map(|t| t.max(1) as u64)
            .unwrap_or(self.default_timeout_secs);

        debug!(cmd = %command, "executing shell_command tool");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        // Isolate the subprocess from the agent's terminal: stdin at
        // /dev/null makes isatty(0) false, and kill_on_drop guarantees the
        // child is reaped when the timeout fires.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        // setsid() detaches the child from the controlling terminal so it
        // cannot open /dev/tty and emit escape sequences past our pipes.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        if let Some(wd) = &workdir {
            cmd.current_dir(wd);
        }

        let result =
            tokio::time::timeout(std::time::Duration::from_secs(timeout), cmd.output()).await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => anyhow::bail!("spawn error: {e}"),
            Err(_) => anyhow::bail!("timeout after {timeout}s"),
        };

        let mut content = String::new();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.is_empty() {
            content.push_str(&head_tail_truncate(&stdout));
        }
        if !stderr.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str("[stderr]\n");
            content.push_str(&head_tail_truncate(&stderr));
        }

        let code = output.status.code().unwrap_or(-1);
        let rendered = match code {
            0 => {
                if content.is_empty() {
                    "[exit 0]".to_string()
                } else {
                    content
                }
            }
            // Exit code 1 is the Unix convention for "no matches" (grep/rg)
            // and "condition false" (test). Reporting it as a hard failure
            // inflates error counters and confuses the model.
            1 => {
                if content.is_empty() {
                    "[exit 1]".to_string()
                } else {
                    format!("[exit 1]\n{content}")
                }
            }
            _ => {
                ctx.ops.record_shell_command(&command, &content);
                anyhow::bail!("[exit {code}]\n{content}")
            }
        };

        ctx.ops.record_shell_command(&command, &rendered);
        ctx.ops.log_action(&format!("$ {command}"));
        Ok(rendered)
    }
}

/// Truncate `s` to fit within `OUTPUT_LIMIT_BYTES`, keeping the first
/// `HEAD_LINES` and last `TAIL_LINES` verbatim with an omission marker in
/// between so both the command preamble and the final errors survive.
pub(crate) fn head_tail_truncate(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }

    let lines: Vec<&str> = s.lines().collect();
    let total = lines.len();

    if total <= HEAD_LINES + TAIL_LINES {
        // Byte budget exceeded by very long lines — fall back to a simple
        // byte-level head + tail split.
        let tail_start = s.len().saturating_sub(OUTPUT_LIMIT_BYTES / 2);
        let tail_str = &s[tail_start..];
        let head_end = OUTPUT_LIMIT_BYTES / 2;
        let head_str = &s[..head_end.min(s.len())];
        let omitted_bytes = s.len() - head_str.len() - tail_str.len();
        return format!("{head_str}\n...[{omitted_bytes} bytes omitted]...\n{tail_str}");
    }

    let head: Vec<&str> = lines[..HEAD_LINES].to_vec();
    let tail: Vec<&str> = lines[total - TAIL_LINES..].to_vec();
    let omitted_lines = total - HEAD_LINES - TAIL_LINES;
    let shown_bytes = head.join("\n").len() + tail.join("\n").len();
    let omitted_bytes = s.len().saturating_sub(shown_bytes);

    format!(
        "{}\n...[{omitted_lines} lines / ~{omitted_bytes} bytes omitted]...\n{}",
        head.join("\n"),
        tail.join("\n")
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::capability::NullOps;
    use crate::params::validate_args;

    async fn run(args: serde_json::Value) -> anyhow::Result<String> {
        let cfg = config(30);
        let validated = validate_args(&cfg.parameters, &args).unwrap();
        let ctx = HandlerCtx {
            ops: Arc::new(NullOps),
            security_bypass: false,
        };
        cfg.handler.run(&ctx, &validated).await
    }

    #[tokio::test]
    async fn executes_echo_and_returns_stdout() {
        let out = run(json!({"command": "echo hello"})).await.unwrap();
        assert!(out.contains("hello"));
    }

    #[tokio::test]
    async fn stdout_and_stderr_both_captured() {
        let out = run(json!({"command": "echo out && echo err >&2"}))
            .await
            .unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("[stderr]"));
        assert!(out.contains("err"));
    }

    #[tokio::test]
    async fn workdir_changes_cwd() {
        let out = run(json!({"command": "pwd", "workdir": "/tmp"}))
            .await
            .unwrap();
        assert!(out.contains("/tmp"));
    }

    #[tokio::test]
    async fn exit_1_is_reported_but_not_error() {
        let out = run(json!({"command": "exit 1"})).await.unwrap();
        assert!(out.contains("[exit 1]"));
    }

    #[tokio::test]
    async fn exit_2_is_error_with_code() {
        let err = run(json!({"command": "exit 2"})).await.unwrap_err();
        assert!(err.to_string().contains("[exit 2]"));
    }

    #[tokio::test]
    async fn timeout_is_error() {
        let err = run(json!({"command": "sleep 60", "timeout_secs": 1}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn cmd_alias_is_accepted() {
        let out = run(json!({"cmd": "echo aliased"})).await.unwrap();
        assert!(out.contains("aliased"));
    }

    // ── Head+tail truncation ──────────────────────────────────────────────────

    #[test]
    fn short_output_passes_through_unchanged() {
        let s = "hello\nworld\n";
        assert_eq!(head_tail_truncate(s), s);
    }

    #[test]
    fn head_and_tail_are_both_preserved() {
        let mut lines: Vec<String> = vec!["BUILD START".to_string()];
        for i in 0..800 {
            lines.push(format!(
                "middle line {i} padding padding padding padding padding"
            ));
        }
        lines.push("BUILD ERROR".to_string());
        let content = lines.join("\n");

        let result = head_tail_truncate(&content);
        assert!(result.contains("BUILD START"), "head should be preserved");
        assert!(result.contains("BUILD ERROR"), "tail should be preserved");
        assert!(result.contains("omitted"), "should have omission marker");
    }
}
