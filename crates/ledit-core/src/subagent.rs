// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use ledit_config::Config;
use ledit_tools::{
    HandlerCtx, ParamType, ParameterConfig, ToolConfig, ToolHandler, ValidatedArgs,
};

use crate::usage::UsageTotals;

/// Cap on the composed child prompt.
const MAX_PROMPT_BYTES: usize = 1_000_000;

/// Cap on captured child stdout / stderr.
const MAX_OUTPUT_BYTES: usize = 10_000_000;

/// How many recent session actions are embedded in the child prompt.
const RECENT_ACTIONS: usize = 10;

/// How many auto-detected files may be inlined.
const MAX_AUTO_FILES: usize = 20;

/// Reserved metrics line printed by the child exactly once before exit.
pub const METRICS_PREFIX: &str = "SUBAGENT_METRICS:";

/// Marker line printed by a child that ran out of token budget.
pub const BUDGET_MARKER: &str = "SUBAGENT_BUDGET_EXCEEDED";

const SECURITY_PATTERNS: &[&str] = &[
    "Security block:",
    "CRITICAL: operation blocked",
    "SUBAGENT_SECURITY",
];

const NO_RETRY: &str = "Do NOT automatically retry this task.";

/// One delegated task.
#[derive(Debug, Clone)]
pub struct SubagentTask {
    pub id: String,
    pub prompt: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub persona: Option<String>,
    /// Prior-work context block embedded ahead of the task.
    pub context: Option<String>,
    /// Files to inline into the prompt (validated to be in the workspace).
    pub files: Vec<String>,
    /// Scan the prompt for path-like tokens and inline those that exist.
    pub auto_files: bool,
}

impl SubagentTask {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            provider: None,
            model: None,
            persona: None,
            context: None,
            files: Vec::new(),
            auto_files: true,
        }
    }
}

/// Parsed `SUBAGENT_METRICS:` line.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SubagentMetrics {
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_cost: f64,
    pub cached_tokens: u64,
}

/// Spawns child agent processes, streams their output, extracts structured
/// summaries, and folds their cost back into the parent's accounting.
pub struct SubagentOrchestrator {
    config: Arc<Config>,
    workdir: PathBuf,
    /// Binary to spawn; the running executable in production, a stub in tests.
    program: PathBuf,
    totals: Arc<Mutex<UsageTotals>>,
    actions: Arc<Mutex<Vec<String>>>,
    stream: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl SubagentOrchestrator {
    pub fn new(
        config: Arc<Config>,
        workdir: PathBuf,
        totals: Arc<Mutex<UsageTotals>>,
        actions: Arc<Mutex<Vec<String>>>,
    ) -> Self {
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("ledit"));
        Self {
            config,
            workdir,
            program,
            totals,
            actions,
            stream: None,
        }
    }

    pub fn with_program(mut self, program: PathBuf) -> Self {
        self.program = program;
        self
    }

    pub fn with_stream(mut self, stream: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
        self.stream = Some(stream);
        self
    }

    // ── Prompt construction ───────────────────────────────────────────────────

    /// Compose the child prompt: context block, recent actions, inlined
    /// files, then the task itself.  Returns the prompt and the file list
    /// that was actually inlined.
    pub fn build_prompt(&self, task: &SubagentTask) -> anyhow::Result<(String, Vec<String>)> {
        let mut sections: Vec<String> = Vec::new();

        if let Some(context) = &task.context {
            if !context.trim().is_empty() {
                sections.push(format!("## Previous work context\n{}", context.trim()));
            }
        }

        {
            let actions = self.actions.lock().unwrap();
            if !actions.is_empty() {
                let recent: Vec<String> = actions
                    .iter()
                    .rev()
                    .take(RECENT_ACTIONS)
                    .rev()
                    .map(|a| format!("- {a}"))
                    .collect();
                sections.push(format!("## Recent session actions\n{}", recent.join("\n")));
            }
        }

        let mut files: Vec<String> = task.files.clone();
        if task.auto_files {
            for candidate in scan_for_paths(&task.prompt) {
                if !files.contains(&candidate) {
                    files.push(candidate);
                }
            }
        }
        let mut files_used: Vec<String> = Vec::new();
        let mut file_blocks: Vec<String> = Vec::new();
        for file in files.iter().take(MAX_AUTO_FILES) {
            let Some(resolved) = self.validate_workspace_path(file) else {
                debug!(file = %file, "skipping file outside workspace");
                continue;
            };
            let Ok(content) = std::fs::read_to_string(&resolved) else {
                continue;
            };
            file_blocks.push(format!("### {file}\n```\n{content}\n```"));
            files_used.push(file.clone());
        }
        if !file_blocks.is_empty() {
            sections.push(format!("## Relevant files\n{}", file_blocks.join("\n\n")));
        }

        sections.push(format!("## Task\n{}", task.prompt));

        let prompt = sections.join("\n\n");
        if prompt.len() > MAX_PROMPT_BYTES {
            anyhow::bail!(
                "composed sub-agent prompt is {} bytes (cap {MAX_PROMPT_BYTES}); \
                 reduce the context or file list",
                prompt.len()
            );
        }
        Ok((prompt, files_used))
    }

    fn validate_workspace_path(&self, path: &str) -> Option<PathBuf> {
        let joined = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.workdir.join(path)
        };
        let resolved = joined.canonicalize().ok()?;
        let root = self.workdir.canonicalize().ok()?;
        if resolved.starts_with(&root) && resolved.is_file() {
            Some(resolved)
        } else {
            None
        }
    }

    // ── Execution ─────────────────────────────────────────────────────────────

    /// Run one task to completion and render the tool-result string.
    pub async fn run_task(&self, task: &SubagentTask, parallel: bool) -> String {
        let (prompt, files_used) = match self.build_prompt(task) {
            Ok(p) => p,
            Err(e) => return json!({ "error": e.to_string() }).to_string(),
        };

        let model = self
            .config
            .resolve_model(task.provider.as_deref(), task.persona.as_deref());
        let model_name = task.model.clone().unwrap_or(model.name);

        let mut cmd = Command::new(&self.program);
        cmd.arg("--prompt")
            .arg(&prompt)
            .arg("--provider")
            .arg(&model.provider)
            .arg("--model")
            .arg(&model_name);
        if let Some(persona) = &task.persona {
            cmd.arg("--persona").arg(persona);
        }
        cmd.env("LEDIT_SUBAGENT", "1")
            .env("LEDIT_FROM_AGENT", "1")
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(task = %task.id, model = %model_name, "spawning sub-agent");

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return json!({ "error": format!("failed to spawn sub-agent: {e}") }).to_string()
            }
        };

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        // Drain stdout line by line, forwarding each (ANSI-stripped) line to
        // the streaming callback as it arrives.
        let stream = self.stream.clone();
        let task_id = task.id.clone();
        let stdout_task = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(pipe) = stdout_pipe {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let clean = strip_ansi(&line);
                    if let Some(cb) = &stream {
                        if parallel {
                            cb(&format!("[{task_id}] {clean}"));
                        } else {
                            cb(&clean);
                        }
                    }
                    if collected.len() < MAX_OUTPUT_BYTES {
                        collected.push_str(&clean);
                        collected.push('\n');
                    }
                }
            }
            collected
        });
        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(pipe) = stderr_pipe {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if collected.len() < MAX_OUTPUT_BYTES {
                        collected.push_str(&strip_ansi(&line));
                        collected.push('\n');
                    }
                }
            }
            collected
        });

        let status = child.wait().await;
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let exit_code = match status {
            Ok(s) => s.code().unwrap_or(-1),
            Err(e) => {
                warn!(task = %task.id, error = %e, "sub-agent wait failed");
                -1
            }
        };

        // Attribute child cost/tokens through the same accounting path as
        // the parent's own responses.
        let metrics = parse_metrics(&stdout);
        if let Some(m) = metrics {
            self.totals.lock().unwrap().attribute_raw(
                m.prompt_tokens,
                m.completion_tokens,
                m.total_tokens,
                m.total_cost,
                m.cached_tokens,
            );
        }

        self.classify(task, exit_code, &stdout, &stderr, metrics, files_used)
    }

    /// Classify the child's exit into the result shapes the parent's model
    /// can act on.
    fn classify(
        &self,
        task: &SubagentTask,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
        metrics: Option<SubagentMetrics>,
        files_used: Vec<String>,
    ) -> String {
        let budget_exceeded = stdout
            .lines()
            .any(|l| l.trim_start().starts_with(BUDGET_MARKER));
        if budget_exceeded {
            return format!(
                "SUBAGENT_TOKEN_BUDGET_EXCEEDED: the sub-agent for task '{}' ran out of \
                 token budget before finishing. {NO_RETRY} Narrow the task or raise the \
                 budget, then decide whether to re-dispatch.\n\n--- partial output ---\n{}",
                task.id,
                tail(stdout, 4000)
            );
        }

        let combined_security = SECURITY_PATTERNS
            .iter()
            .find(|p| stdout.contains(**p) || stderr.contains(**p));
        if let Some(pattern) = combined_security {
            return format!(
                "SUBAGENT_SECURITY_ERROR: the sub-agent for task '{}' was stopped by a \
                 security control ({pattern}). {NO_RETRY} Re-plan the task without the \
                 blocked operation.\n\n--- output ---\n{}",
                task.id,
                tail(stdout, 4000)
            );
        }

        let mut result = Map::new();
        result.insert("task_id".into(), json!(task.id));
        result.insert("exit_code".into(), json!(exit_code));
        result.insert("stdout".into(), json!(tail(stdout, 20_000)));
        if !stderr.trim().is_empty() {
            result.insert("stderr".into(), json!(tail(stderr, 4000)));
        }
        result.insert("summary".into(), Value::Object(extract_summary(stdout, metrics)));
        result.insert("budget_exceeded".into(), json!(false));
        result.insert("context_used".into(), json!(task.context.is_some()));
        result.insert("files_used".into(), json!(files_used));
        if exit_code != 0 {
            result.insert(
                "error".into(),
                json!(format!("sub-agent exited with code {exit_code}")),
            );
        }
        Value::Object(result).to_string()
    }

    /// Run every requested task with at most `subagent.max_parallel`
    /// children alive at once (longer lists execute in batches), and
    /// aggregate the results keyed by task id.  A batch resolves only when
    /// every task in it finished; a security error short-circuits the
    /// aggregate result and no further batches are dispatched.
    pub async fn run_parallel(&self, tasks: Vec<SubagentTask>) -> String {
        let cap = self.config.subagent.max_parallel.max(1);
        let mut results: Vec<(String, String)> = Vec::with_capacity(tasks.len());

        for batch in tasks.chunks(cap) {
            let futures: Vec<_> = batch
                .iter()
                .map(|t| async { (t.id.clone(), self.run_task(t, true).await) })
                .collect();
            results.extend(futures::future::join_all(futures).await);

            if let Some((id, err)) = results
                .iter()
                .find(|(_, r)| r.starts_with("SUBAGENT_SECURITY_ERROR"))
            {
                return format!(
                    "{err}\n(first security failure in parallel batch, task '{id}')"
                );
            }
        }

        let mut map = Map::new();
        for (id, result) in results {
            let value = serde_json::from_str::<Value>(&result).unwrap_or(Value::String(result));
            map.insert(id, value);
        }
        Value::Object(map).to_string()
    }
}

// ─── Line-level helpers ───────────────────────────────────────────────────────

/// Strip ANSI escape sequences from one streamed line.
pub fn strip_ansi(line: &str) -> String {
    let re = Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07]*\x07").unwrap();
    re.replace_all(line, "").into_owned()
}

fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}

/// Parse the reserved metrics line emitted by the child.
pub fn parse_metrics(stdout: &str) -> Option<SubagentMetrics> {
    let line = stdout
        .lines()
        .rev()
        .find(|l| l.trim_start().starts_with(METRICS_PREFIX))?;
    let mut m = SubagentMetrics::default();
    for pair in line.trim_start()[METRICS_PREFIX.len()..].split_whitespace() {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "total_tokens" => m.total_tokens = value.parse().unwrap_or(0),
            "prompt_tokens" => m.prompt_tokens = value.parse().unwrap_or(0),
            "completion_tokens" => m.completion_tokens = value.parse().unwrap_or(0),
            "total_cost" => m.total_cost = value.parse().unwrap_or(0.0),
            "cached_tokens" => m.cached_tokens = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    Some(m)
}

/// Build the structured summary map from anchored line prefixes.
pub fn extract_summary(stdout: &str, metrics: Option<SubagentMetrics>) -> Map<String, Value> {
    let mut files: Vec<String> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    let mut commands: Vec<String> = Vec::new();
    let mut build_status: Option<String> = None;
    let mut test_status: Option<String> = None;
    let test_counts = Regex::new(r"(?i)\b(\d+)\s+(passed|failed)\b").unwrap();

    for raw in stdout.lines() {
        let line = raw.trim();
        if let Some(rest) = line
            .strip_prefix("Created: ")
            .or_else(|| line.strip_prefix("Modified: "))
            .or_else(|| line.strip_prefix("Deleted: "))
            .or_else(|| line.strip_prefix("Updated: "))
        {
            files.push(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Build: ") {
            build_status = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Test: ") {
            test_status = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Error: ") {
            errors.push(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("$ ") {
            commands.push(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Executing command: ") {
            commands.push(rest.trim().to_string());
        } else if test_status.is_none() && test_counts.is_match(line) {
            test_status = Some(line.to_string());
        }
    }

    let mut summary = Map::new();
    summary.insert("files".into(), json!(files));
    summary.insert("errors".into(), json!(errors));
    summary.insert("commands".into(), json!(commands));
    if let Some(b) = build_status {
        summary.insert("build_status".into(), json!(b));
    }
    if let Some(t) = test_status {
        summary.insert("test_status".into(), json!(t));
    }
    if let Some(m) = metrics {
        summary.insert("subagent_total_tokens".into(), json!(m.total_tokens));
        summary.insert("subagent_total_cost".into(), json!(m.total_cost));
    }
    summary
}

/// Scan a task prompt for path-like tokens: quoted, backticked, following a
/// mutation verb, or carrying a common source-file extension.
pub fn scan_for_paths(prompt: &str) -> Vec<String> {
    let patterns = [
        r#""([\w./-]+)""#,
        r"'([\w./-]+)'",
        r"`([\w./-]+)`",
        r"(?i)\b(?:modify|create|edit|update|read|open|fix)\s+([\w./-]+\.[\w]+)",
        r"\b([\w./-]+\.(?:rs|go|py|js|ts|tsx|c|h|cpp|hpp|md|toml|yaml|yml|json|sh|txt))\b",
    ];
    let mut out: Vec<String> = Vec::new();
    for p in patterns {
        let re = Regex::new(p).unwrap();
        for cap in re.captures_iter(prompt) {
            let candidate = cap.get(1).unwrap().as_str().trim_matches('.').to_string();
            if candidate.is_empty() || out.contains(&candidate) {
                continue;
            }
            out.push(candidate);
        }
    }
    out
}

// ─── Tool registration ────────────────────────────────────────────────────────

pub fn run_subagent_config(orchestrator: Arc<SubagentOrchestrator>) -> ToolConfig {
    ToolConfig {
        name: "run_subagent",
        description: "Delegate a focused task to a child agent process. The \
                      child works non-interactively with the same tool set \
                      (minus sub-agent spawning) and returns a structured \
                      result with summary and metrics.",
        parameters: vec![
            ParameterConfig::required("prompt", ParamType::String, "Task description")
                .with_aliases(&["task"]),
            ParameterConfig::optional("provider", ParamType::String, "Provider key override"),
            ParameterConfig::optional("model", ParamType::String, "Model name override"),
            ParameterConfig::optional("persona", ParamType::String, "Persona name"),
            ParameterConfig::optional(
                "context",
                ParamType::String,
                "Prior-work context to embed in the child prompt",
            ),
            ParameterConfig::optional(
                "files",
                ParamType::Array,
                "Workspace files to inline into the child prompt",
            ),
            ParameterConfig::optional(
                "auto_files",
                ParamType::Bool,
                "Scan the prompt for file paths to inline (default true)",
            ),
        ],
        read_only: false,
        handler: Arc::new(RunSubagentHandler { orchestrator }),
    }
}

pub fn run_parallel_subagents_config(orchestrator: Arc<SubagentOrchestrator>) -> ToolConfig {
    ToolConfig {
        name: "run_parallel_subagents",
        description: "Run independent sub-agent tasks concurrently; at most \
                      5 children run at once and longer lists execute in \
                      batches. Each task object takes the same fields as \
                      run_subagent plus an 'id'. Results are keyed by task \
                      id — every requested task gets an entry.",
        parameters: vec![ParameterConfig::required(
            "tasks",
            ParamType::Array,
            "Array of task objects: {id, prompt, provider?, model?, persona?, \
             context?, files?, auto_files?}",
        )],
        read_only: false,
        handler: Arc::new(RunParallelHandler { orchestrator }),
    }
}

struct RunSubagentHandler {
    orchestrator: Arc<SubagentOrchestrator>,
}

fn task_from_value(id: String, value: &Value) -> Option<SubagentTask> {
    let prompt = value
        .get("prompt")
        .or_else(|| value.get("task"))
        .and_then(Value::as_str)?;
    let mut task = SubagentTask::new(
        value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(id),
        prompt,
    );
    task.provider = value.get("provider").and_then(Value::as_str).map(Into::into);
    task.model = value.get("model").and_then(Value::as_str).map(Into::into);
    task.persona = value.get("persona").and_then(Value::as_str).map(Into::into);
    task.context = value.get("context").and_then(Value::as_str).map(Into::into);
    task.files = value
        .get("files")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    task.auto_files = value.get("auto_files").and_then(Value::as_bool).unwrap_or(true);
    Some(task)
}

#[async_trait]
impl ToolHandler for RunSubagentHandler {
    async fn run(&self, _ctx: &HandlerCtx, args: &ValidatedArgs) -> anyhow::Result<String> {
        let mut task = SubagentTask::new("subagent", args.str("prompt").unwrap_or_default());
        task.provider = args.str("provider").map(Into::into);
        task.model = args.str("model").map(Into::into);
        task.persona = args.str("persona").map(Into::into);
        task.context = args.str("context").map(Into::into);
        if let Some(files) = args.array("files") {
            task.files = files
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        task.auto_files = args.bool("auto_files").unwrap_or(true);
        Ok(self.orchestrator.run_task(&task, false).await)
    }
}

struct RunParallelHandler {
    orchestrator: Arc<SubagentOrchestrator>,
}

#[async_trait]
impl ToolHandler for RunParallelHandler {
    async fn run(&self, _ctx: &HandlerCtx, args: &ValidatedArgs) -> anyhow::Result<String> {
        let raw = args
            .array("tasks")
            .ok_or_else(|| anyhow::anyhow!("'tasks' must be an array"))?;
        let tasks: Vec<SubagentTask> = raw
            .iter()
            .enumerate()
            .filter_map(|(i, v)| task_from_value(format!("task_{i}"), v))
            .collect();
        if tasks.is_empty() {
            anyhow::bail!("no valid tasks: each task needs at least a 'prompt'");
        }
        Ok(self.orchestrator.run_parallel(tasks).await)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator_at(workdir: &Path) -> SubagentOrchestrator {
        SubagentOrchestrator::new(
            Arc::new(Config::default()),
            workdir.to_path_buf(),
            Arc::new(Mutex::new(UsageTotals::default())),
            Arc::new(Mutex::new(Vec::new())),
        )
    }

    /// Write an executable stub the orchestrator spawns instead of the real
    /// binary.  The stub ignores its flags and runs the given script.
    fn stub_program(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-agent.sh");
        std::fs::write(&path, format!("#!/bin/bash\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    // ── Metrics parsing ───────────────────────────────────────────────────────

    #[test]
    fn metrics_line_parses_all_fields() {
        let stdout = "working...\nSUBAGENT_METRICS: total_tokens=1200 prompt_tokens=1000 \
                      completion_tokens=200 total_cost=0.034 cached_tokens=150\n";
        let m = parse_metrics(stdout).unwrap();
        assert_eq!(m.total_tokens, 1200);
        assert_eq!(m.prompt_tokens, 1000);
        assert_eq!(m.completion_tokens, 200);
        assert!((m.total_cost - 0.034).abs() < 1e-9);
        assert_eq!(m.cached_tokens, 150);
    }

    #[test]
    fn missing_metrics_line_is_none() {
        assert!(parse_metrics("no metrics here\n").is_none());
    }

    // ── Summary extraction ────────────────────────────────────────────────────

    #[test]
    fn summary_collects_anchored_prefixes() {
        let stdout = "\
Created: src/new.rs
Modified: src/lib.rs
Build: ok
Test: 12 passed, 0 failed
Error: warning treated as error in old.rs
$ cargo test
Executing command: cargo fmt
";
        let s = extract_summary(stdout, None);
        assert_eq!(s["files"].as_array().unwrap().len(), 2);
        assert_eq!(s["build_status"], "ok");
        assert_eq!(s["test_status"], "12 passed, 0 failed");
        assert_eq!(s["errors"].as_array().unwrap().len(), 1);
        assert_eq!(s["commands"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn summary_falls_back_to_test_count_regex() {
        let s = extract_summary("running 9 tests\n9 passed; 0 failed\n", None);
        assert!(s["test_status"].as_str().unwrap().contains("9 passed"));
    }

    #[test]
    fn summary_includes_metrics_when_present() {
        let m = SubagentMetrics {
            total_tokens: 500,
            total_cost: 0.01,
            ..Default::default()
        };
        let s = extract_summary("", Some(m));
        assert_eq!(s["subagent_total_tokens"], 500);
    }

    // ── ANSI stripping ────────────────────────────────────────────────────────

    #[test]
    fn ansi_codes_are_stripped() {
        assert_eq!(strip_ansi("\x1b[32mok\x1b[0m done"), "ok done");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    // ── Auto-file scanning ────────────────────────────────────────────────────

    #[test]
    fn scan_finds_quoted_backticked_and_extension_paths() {
        let prompt =
            "Please modify src/main.rs and look at `lib/util.py`, then check \"docs/plan.md\".";
        let found = scan_for_paths(prompt);
        assert!(found.contains(&"src/main.rs".to_string()));
        assert!(found.contains(&"lib/util.py".to_string()));
        assert!(found.contains(&"docs/plan.md".to_string()));
    }

    #[test]
    fn scan_ignores_plain_words() {
        let found = scan_for_paths("improve the performance of the loop");
        assert!(found.is_empty());
    }

    // ── Prompt construction ───────────────────────────────────────────────────

    #[test]
    fn prompt_embeds_context_actions_files_and_task() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("helper.rs"), "fn help() {}").unwrap();
        let orch = orchestrator_at(dir.path());
        orch.actions.lock().unwrap().extend([
            "Read: src/a.rs".to_string(),
            "$ cargo check".to_string(),
        ]);

        let mut task = SubagentTask::new("t1", "Fix the bug in helper.rs");
        task.context = Some("We found a panic in helper".into());
        let (prompt, files_used) = orch.build_prompt(&task).unwrap();

        assert!(prompt.contains("## Previous work context"));
        assert!(prompt.contains("We found a panic"));
        assert!(prompt.contains("## Recent session actions"));
        assert!(prompt.contains("- $ cargo check"));
        assert!(prompt.contains("## Relevant files"));
        assert!(prompt.contains("fn help() {}"));
        assert!(prompt.ends_with("## Task\nFix the bug in helper.rs"));
        assert_eq!(files_used, vec!["helper.rs"]);
    }

    #[test]
    fn prompt_keeps_only_last_ten_actions() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator_at(dir.path());
        for i in 0..15 {
            orch.actions.lock().unwrap().push(format!("action {i}"));
        }
        let task = SubagentTask::new("t", "do something");
        let (prompt, _) = orch.build_prompt(&task).unwrap();
        assert!(!prompt.contains("action 4"));
        assert!(prompt.contains("action 5"));
        assert!(prompt.contains("action 14"));
    }

    #[test]
    fn files_outside_workspace_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator_at(dir.path());
        let mut task = SubagentTask::new("t", "inspect things");
        task.auto_files = false;
        task.files = vec!["/etc/hostname".into()];
        let (prompt, files_used) = orch.build_prompt(&task).unwrap();
        assert!(files_used.is_empty());
        assert!(!prompt.contains("## Relevant files"));
    }

    #[test]
    fn oversized_prompt_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator_at(dir.path());
        let mut task = SubagentTask::new("t", "x");
        task.context = Some("c".repeat(MAX_PROMPT_BYTES + 1));
        assert!(orch.build_prompt(&task).is_err());
    }

    // ── Child execution ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn successful_child_returns_result_map() {
        let dir = tempfile::tempdir().unwrap();
        let program = stub_program(
            dir.path(),
            "echo 'Created: src/out.rs'\n\
             echo 'Build: ok'\n\
             echo 'SUBAGENT_METRICS: total_tokens=100 prompt_tokens=80 completion_tokens=20 total_cost=0.002 cached_tokens=0'",
        );
        let orch = orchestrator_at(dir.path()).with_program(program);
        let task = SubagentTask::new("t1", "produce output");
        let result = orch.run_task(&task, false).await;
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["exit_code"], 0);
        assert_eq!(parsed["budget_exceeded"], false);
        assert_eq!(parsed["summary"]["build_status"], "ok");
        assert_eq!(parsed["summary"]["subagent_total_tokens"], 100);
    }

    #[tokio::test]
    async fn child_metrics_are_attributed_to_parent_totals() {
        let dir = tempfile::tempdir().unwrap();
        let program = stub_program(
            dir.path(),
            "echo 'SUBAGENT_METRICS: total_tokens=300 prompt_tokens=250 completion_tokens=50 total_cost=0.01 cached_tokens=0'",
        );
        let orch = orchestrator_at(dir.path()).with_program(program);
        orch.run_task(&SubagentTask::new("t", "x"), false).await;
        let totals = orch.totals.lock().unwrap();
        assert_eq!(totals.total_tokens, 300);
        assert!((totals.total_cost - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn budget_exhaustion_yields_non_retryable_message() {
        let dir = tempfile::tempdir().unwrap();
        let program = stub_program(
            dir.path(),
            "echo 'partial work done'\necho 'SUBAGENT_BUDGET_EXCEEDED: tokens=5000 budget=4000'",
        );
        let orch = orchestrator_at(dir.path()).with_program(program);
        let result = orch.run_task(&SubagentTask::new("t", "x"), false).await;
        assert!(result.starts_with("SUBAGENT_TOKEN_BUDGET_EXCEEDED"));
        assert!(result.contains("Do NOT automatically retry"));
        assert!(result.contains("partial work done"));
    }

    #[tokio::test]
    async fn security_block_yields_non_retryable_message() {
        let dir = tempfile::tempdir().unwrap();
        let program = stub_program(
            dir.path(),
            "echo 'CRITICAL: operation blocked: removal of system directory /usr'\nexit 3",
        );
        let orch = orchestrator_at(dir.path()).with_program(program);
        let result = orch.run_task(&SubagentTask::new("t", "x"), false).await;
        assert!(result.starts_with("SUBAGENT_SECURITY_ERROR"));
        assert!(result.contains("Do NOT automatically retry"));
    }

    #[tokio::test]
    async fn nonzero_exit_includes_error_but_allows_retry() {
        let dir = tempfile::tempdir().unwrap();
        let program = stub_program(dir.path(), "echo 'something broke' >&2\nexit 2");
        let orch = orchestrator_at(dir.path()).with_program(program);
        let result = orch.run_task(&SubagentTask::new("t", "x"), false).await;
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["exit_code"], 2);
        assert!(parsed["error"].as_str().unwrap().contains("code 2"));
        assert!(!result.contains("Do NOT automatically retry"));
    }

    #[tokio::test]
    async fn streaming_callback_sees_prefixed_lines_in_parallel_mode() {
        let dir = tempfile::tempdir().unwrap();
        let program = stub_program(dir.path(), "echo hello");
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let orch = orchestrator_at(dir.path())
            .with_program(program)
            .with_stream(Arc::new(move |line| {
                sink.lock().unwrap().push(line.to_string());
            }));
        orch.run_task(&SubagentTask::new("tid9", "x"), true).await;
        let lines = seen.lock().unwrap();
        assert!(lines.iter().any(|l| l == "[tid9] hello"), "{lines:?}");
    }

    #[tokio::test]
    async fn parallel_batch_aggregates_by_task_id() {
        let dir = tempfile::tempdir().unwrap();
        let program = stub_program(dir.path(), "echo done");
        let orch = orchestrator_at(dir.path()).with_program(program);
        let result = orch
            .run_parallel(vec![
                SubagentTask::new("alpha", "a"),
                SubagentTask::new("beta", "b"),
            ])
            .await;
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert!(parsed.get("alpha").is_some());
        assert!(parsed.get("beta").is_some());
        assert_eq!(parsed["alpha"]["exit_code"], 0);
    }

    #[tokio::test]
    async fn parallel_security_error_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let program = stub_program(dir.path(), "echo 'Security block: refused'\nexit 1");
        let orch = orchestrator_at(dir.path()).with_program(program);
        let result = orch
            .run_parallel(vec![SubagentTask::new("only", "x")])
            .await;
        assert!(result.starts_with("SUBAGENT_SECURITY_ERROR"));
    }

    #[tokio::test]
    async fn parallel_runs_every_task_beyond_the_concurrency_cap() {
        let dir = tempfile::tempdir().unwrap();
        let program = stub_program(dir.path(), "echo ok");
        let orch = orchestrator_at(dir.path()).with_program(program);
        // 8 tasks against a cap of 5: two batches, nothing dropped.
        let tasks: Vec<SubagentTask> = (0..8)
            .map(|i| SubagentTask::new(format!("t{i}"), "x"))
            .collect();
        let result = orch.run_parallel(tasks).await;
        let parsed: Value = serde_json::from_str(&result).unwrap();
        let map = parsed.as_object().unwrap();
        assert_eq!(map.len(), 8, "every requested task must resolve");
        for i in 0..8 {
            let entry = &map[&format!("t{i}")];
            assert_eq!(entry["exit_code"], 0, "task t{i} ran");
        }
    }

    #[test]
    fn task_from_value_parses_full_object() {
        let v = json!({
            "id": "custom",
            "prompt": "do it",
            "model": "m1",
            "files": ["a.rs"],
            "auto_files": false
        });
        let t = task_from_value("fallback".into(), &v).unwrap();
        assert_eq!(t.id, "custom");
        assert_eq!(t.model.as_deref(), Some("m1"));
        assert_eq!(t.files, vec!["a.rs"]);
        assert!(!t.auto_files);
    }

    #[test]
    fn task_from_value_without_prompt_is_none() {
        assert!(task_from_value("x".into(), &json!({"id": "a"})).is_none());
    }
}
