// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use ledit_config::SecurityConfig;
use ledit_model::{ChatRequest, LlmClient, Message};

/// Classification of a tool call by the security gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Run without further checks.
    Allow,
    /// Prompt the user before running (interactive mode only — in
    /// non-interactive mode the gate resolves this itself via the
    /// second-opinion path and never returns it).
    NeedsConfirm(String),
    /// Refused by the LLM validator or policy.
    Block(String),
    /// Refused by the hard critical-operation predicate.  Applies in every
    /// mode, including unsafe mode.
    CriticalBlock(String),
}

/// Verdict returned by the LLM-backed risk validator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RiskAssessment {
    #[serde(default)]
    pub risk_level: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub should_block: bool,
    #[serde(default)]
    pub should_confirm: bool,
    #[serde(default)]
    pub is_soft_block: bool,
}

/// Seam for risk classification so the gate can be tested without a model.
#[async_trait]
pub trait RiskValidator: Send + Sync {
    async fn assess(&self, tool_name: &str, args: &Value) -> anyhow::Result<RiskAssessment>;

    /// Non-interactive confirmation: a second, independent model call that
    /// must answer with exactly `{"approved": true}` for the call to run.
    async fn second_opinion(
        &self,
        tool_name: &str,
        args: &Value,
        reasoning: &str,
    ) -> anyhow::Result<bool>;
}

/// Security gate applied to every dispatched tool call.
///
/// The critical predicate always runs first and can never be bypassed.
/// Everything after it is skipped in unsafe mode.  Validator failures fail
/// open: for a local dev tool, availability wins and the critical predicate
/// remains the backstop.
pub struct SecurityGate {
    config: SecurityConfig,
    validator: Option<Arc<dyn RiskValidator>>,
}

impl SecurityGate {
    pub fn new(config: SecurityConfig, validator: Option<Arc<dyn RiskValidator>>) -> Self {
        Self { config, validator }
    }

    pub fn permissive() -> Self {
        Self {
            config: SecurityConfig {
                unsafe_mode: false,
                llm_validation: false,
                interactive: false,
            },
            validator: None,
        }
    }

    pub async fn classify(&self, tool_name: &str, args: &Value) -> GateDecision {
        if let Some(reason) = critical_block_reason(tool_name, args) {
            return GateDecision::CriticalBlock(reason);
        }

        if self.config.unsafe_mode {
            return GateDecision::Allow;
        }

        if self.config.llm_validation {
            if let Some(validator) = &self.validator {
                match validator.assess(tool_name, args).await {
                    Ok(assessment) => {
                        if assessment.should_block {
                            return GateDecision::Block(assessment.reasoning);
                        }
                        if assessment.should_confirm {
                            if self.config.interactive {
                                return GateDecision::NeedsConfirm(assessment.reasoning);
                            }
                            // Headless: escalate to a second opinion instead
                            // of prompting.  Only an explicit approval runs.
                            match validator
                                .second_opinion(tool_name, args, &assessment.reasoning)
                                .await
                            {
                                Ok(true) => return GateDecision::Allow,
                                Ok(false) => {
                                    return GateDecision::Block(format!(
                                        "second opinion rejected: {}",
                                        assessment.reasoning
                                    ))
                                }
                                Err(e) => {
                                    warn!(tool = tool_name, error = %e,
                                          "second-opinion call failed; failing open");
                                    return GateDecision::Allow;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(tool = tool_name, error = %e,
                              "risk validator failed; failing open");
                    }
                }
            }
        }

        GateDecision::Allow
    }
}

// ─── Critical-operation predicate ─────────────────────────────────────────────

const PROTECTED_DIRS: &[&str] = &[
    "/usr", "/bin", "/sbin", "/etc", "/lib", "/lib64", "/boot", "/var", "/sys", "/proc", "/dev",
];

const PROTECTED_FILES: &[&str] = &["/etc/shadow", "/etc/passwd", "/etc/sudoers"];

/// Hard predicate covering operations that must never run, in any mode.
///
/// Returns the human-readable reason when the call matches.
pub fn critical_block_reason(tool_name: &str, args: &Value) -> Option<String> {
    match tool_name {
        "shell_command" => {
            let command = args
                .get("command")
                .or_else(|| args.get("cmd"))
                .and_then(Value::as_str)?;
            critical_command_reason(command)
        }
        "write_file" | "edit_file" => {
            let path = args
                .get("path")
                .or_else(|| args.get("file_path"))
                .and_then(Value::as_str)?;
            critical_path_reason(path)
        }
        _ => None,
    }
}

fn critical_command_reason(command: &str) -> Option<String> {
    let cmd = command.trim();
    let lower = cmd.to_lowercase();

    // Filesystem destruction
    for fs_tool in ["mkfs", "fdisk"] {
        if word_invokes(&lower, fs_tool) {
            return Some(format!("'{fs_tool}' destroys or repartitions filesystems"));
        }
    }
    if word_invokes(&lower, "dd") && lower.contains("of=/dev/") {
        return Some("'dd' writing to a device path".to_string());
    }

    // Deletion of system directories
    if word_invokes(&lower, "rm") {
        for dir in PROTECTED_DIRS {
            if targets_path(cmd, dir) {
                return Some(format!("removal of system directory {dir}"));
            }
        }
        if targets_path(cmd, "/") {
            return Some("removal of filesystem root".to_string());
        }
    }

    // Modification of critical config
    for file in PROTECTED_FILES {
        if lower.contains(file) && writes_to_file(&lower) {
            return Some(format!("modification of {file}"));
        }
    }
    if lower.contains("visudo") || lower.contains("/etc/sudoers") {
        if writes_to_file(&lower) || lower.contains("visudo") {
            return Some("modification of sudoers".to_string());
        }
    }

    // Fork bomb: a function that pipes into itself and backgrounds
    if lower.contains(":(){ :|:& };:") || fork_bomb_shape(&lower) {
        return Some("fork bomb".to_string());
    }

    if lower.contains("killall -9") {
        return Some("indiscriminate killall -9".to_string());
    }

    if lower.contains("chmod 000 /") && targets_path(cmd, "/") {
        return Some("chmod 000 on filesystem root".to_string());
    }

    None
}

fn critical_path_reason(path: &str) -> Option<String> {
    let normalized = path.trim();
    for file in PROTECTED_FILES {
        if normalized == *file {
            return Some(format!("writes to critical config {file}"));
        }
    }
    if normalized.starts_with("/etc/sudoers") {
        return Some("writes to sudoers".to_string());
    }
    None
}

/// True when `name` appears as an invoked command word (start of the line or
/// after a separator), not merely as a substring of a path or argument.
/// Byte-wise scan so non-ASCII arguments cannot land a slice mid-character.
fn word_invokes(command: &str, name: &str) -> bool {
    let bytes = command.as_bytes();
    let needle = name.as_bytes();
    let mut start_of_word = true;
    let mut i = 0;
    while i < bytes.len() {
        if start_of_word
            && i + needle.len() <= bytes.len()
            && &bytes[i..i + needle.len()] == needle
        {
            let boundary_after = bytes
                .get(i + needle.len())
                .map_or(true, |b| b.is_ascii_whitespace() || *b == b'.' || *b == b';');
            // "mkfs.ext4" still counts — '.' boundary above
            if boundary_after {
                return true;
            }
        }
        let b = bytes[i];
        start_of_word =
            b.is_ascii_whitespace() || matches!(b, b';' | b'|' | b'&' | b'(' | b'`');
        i += 1;
    }
    false
}

/// True when the command names `dir` itself (or a trailing-slash/glob form of
/// it) as an argument — `/usr`, `/usr/`, `/usr/*` — as opposed to a deeper
/// path like `/usr/local/share/myapp`.
fn targets_path(command: &str, dir: &str) -> bool {
    command.split_whitespace().any(|tok| {
        let tok = tok.trim_matches(|c| c == '"' || c == '\'');
        tok == dir
            || tok == format!("{dir}/")
            || tok == format!("{dir}/*")
            || (dir == "/" && tok == "/*")
    })
}

fn writes_to_file(command: &str) -> bool {
    command.contains('>')
        || command.contains("tee ")
        || command.contains("sed -i")
        || word_invokes(command, "chmod")
        || word_invokes(command, "chown")
        || word_invokes(command, "rm")
        || word_invokes(command, "mv")
        || word_invokes(command, "cp")
}

/// Shell function defined to pipe into itself with a background fork:
/// `f(){ f|f& };f` in any spelling.
fn fork_bomb_shape(command: &str) -> bool {
    let re = regex::Regex::new(r"(\w+|:)\(\)\s*\{[^}]*\|[^}]*&[^}]*\}\s*;").unwrap();
    re.is_match(command)
}

// ─── LLM-backed validator ─────────────────────────────────────────────────────

const ASSESS_PROMPT: &str = "\
You are a security validator for a coding agent's tool calls. Classify the \
risk of the tool call below. Respond with ONLY a JSON object of the form \
{\"risk_level\": \"low|medium|high\", \"reasoning\": \"...\", \
\"should_block\": bool, \"should_confirm\": bool, \"is_soft_block\": bool}. \
Block operations that are destructive, exfiltrate secrets, or escalate \
privileges. Ask for confirmation when intent is plausible but the blast \
radius is large.";

const SECOND_OPINION_PROMPT: &str = "\
A previous validator flagged the tool call below for confirmation and no \
human is available. Decide whether it should proceed. Respond with ONLY the \
JSON object {\"approved\": true} or {\"approved\": false}. Approve only when \
the operation is clearly safe in an automated context.";

/// Risk validator backed by an [`LlmClient`].
pub struct LlmRiskValidator {
    client: Arc<dyn LlmClient>,
}

impl LlmRiskValidator {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    fn describe(tool_name: &str, args: &Value) -> String {
        format!(
            "Tool: {tool_name}\nArguments: {}",
            serde_json::to_string(args).unwrap_or_else(|_| "{}".into())
        )
    }
}

#[async_trait]
impl RiskValidator for LlmRiskValidator {
    async fn assess(&self, tool_name: &str, args: &Value) -> anyhow::Result<RiskAssessment> {
        let req = ChatRequest {
            messages: vec![
                Message::system(ASSESS_PROMPT),
                Message::user(Self::describe(tool_name, args)),
            ],
            ..Default::default()
        };
        let resp = self.client.send_chat_request(req).await?;
        let content = resp
            .message()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let assessment = parse_json_object(&content)
            .ok_or_else(|| anyhow::anyhow!("validator returned non-JSON: {content}"))?;
        Ok(serde_json::from_value(assessment)?)
    }

    async fn second_opinion(
        &self,
        tool_name: &str,
        args: &Value,
        reasoning: &str,
    ) -> anyhow::Result<bool> {
        let req = ChatRequest {
            messages: vec![
                Message::system(SECOND_OPINION_PROMPT),
                Message::user(format!(
                    "{}\nFirst validator's reasoning: {reasoning}",
                    Self::describe(tool_name, args)
                )),
            ],
            ..Default::default()
        };
        let resp = self.client.send_chat_request(req).await?;
        let content = resp
            .message()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let obj = parse_json_object(&content)
            .ok_or_else(|| anyhow::anyhow!("second opinion returned non-JSON: {content}"))?;
        // Only an explicit {"approved": true} counts.
        Ok(obj.get("approved").and_then(Value::as_bool) == Some(true))
    }
}

/// Extract the first JSON object from a model reply that may wrap it in
/// prose or a code fence.
fn parse_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn shell_args(cmd: &str) -> Value {
        json!({ "command": cmd })
    }

    // ── Critical predicate ────────────────────────────────────────────────────

    #[test]
    fn rm_rf_usr_is_critical() {
        assert!(critical_block_reason("shell_command", &shell_args("rm -rf /usr")).is_some());
    }

    #[test]
    fn rm_rf_root_is_critical() {
        assert!(critical_block_reason("shell_command", &shell_args("rm -rf /")).is_some());
        assert!(critical_block_reason("shell_command", &shell_args("rm -rf /*")).is_some());
    }

    #[test]
    fn rm_of_project_subdir_is_not_critical() {
        assert!(
            critical_block_reason("shell_command", &shell_args("rm -rf ./target")).is_none()
        );
        assert!(critical_block_reason(
            "shell_command",
            &shell_args("rm /usr/local/share/myapp/cache.tmp")
        )
        .is_none());
    }

    #[test]
    fn mkfs_and_fdisk_are_critical() {
        assert!(
            critical_block_reason("shell_command", &shell_args("mkfs.ext4 /dev/sda1")).is_some()
        );
        assert!(critical_block_reason("shell_command", &shell_args("fdisk /dev/sda")).is_some());
    }

    #[test]
    fn dd_to_device_is_critical_but_dd_to_file_is_not() {
        assert!(critical_block_reason(
            "shell_command",
            &shell_args("dd if=/dev/zero of=/dev/sda")
        )
        .is_some());
        assert!(critical_block_reason(
            "shell_command",
            &shell_args("dd if=image.iso of=backup.img")
        )
        .is_none());
    }

    #[test]
    fn shadow_and_passwd_writes_are_critical() {
        assert!(critical_block_reason(
            "shell_command",
            &shell_args("echo x >> /etc/shadow")
        )
        .is_some());
        assert!(critical_block_reason(
            "shell_command",
            &shell_args("sed -i s/a/b/ /etc/passwd")
        )
        .is_some());
        // Reading is fine
        assert!(
            critical_block_reason("shell_command", &shell_args("cat /etc/passwd")).is_none()
        );
    }

    #[test]
    fn write_file_to_sudoers_is_critical() {
        assert!(
            critical_block_reason("write_file", &json!({"path": "/etc/sudoers"})).is_some()
        );
        assert!(critical_block_reason(
            "write_file",
            &json!({"path": "/etc/sudoers.d/myrule"})
        )
        .is_some());
        assert!(critical_block_reason("write_file", &json!({"path": "src/main.rs"})).is_none());
    }

    #[test]
    fn fork_bomb_is_critical() {
        assert!(
            critical_block_reason("shell_command", &shell_args(":(){ :|:& };:")).is_some()
        );
        assert!(critical_block_reason(
            "shell_command",
            &shell_args("bomb(){ bomb|bomb& };bomb")
        )
        .is_some());
    }

    #[test]
    fn killall_9_and_chmod_000_root_are_critical() {
        assert!(critical_block_reason("shell_command", &shell_args("killall -9 node")).is_some());
        assert!(critical_block_reason("shell_command", &shell_args("chmod 000 /")).is_some());
    }

    #[test]
    fn ordinary_commands_pass() {
        for cmd in [
            "cargo build",
            "ls -la",
            "git status",
            "grep -r main src/",
            "rm Cargo.lock",
            "chmod +x script.sh",
        ] {
            assert!(
                critical_block_reason("shell_command", &shell_args(cmd)).is_none(),
                "{cmd} should not be critical"
            );
        }
    }

    #[test]
    fn read_only_tools_never_match() {
        assert!(critical_block_reason("read_file", &json!({"path": "/etc/shadow"})).is_none());
    }

    // ── Gate flow ─────────────────────────────────────────────────────────────

    struct FixedValidator {
        assessment: RiskAssessment,
        approve_second: bool,
        fail: bool,
    }

    #[async_trait]
    impl RiskValidator for FixedValidator {
        async fn assess(&self, _t: &str, _a: &Value) -> anyhow::Result<RiskAssessment> {
            if self.fail {
                anyhow::bail!("validator unavailable");
            }
            Ok(self.assessment.clone())
        }
        async fn second_opinion(&self, _t: &str, _a: &Value, _r: &str) -> anyhow::Result<bool> {
            Ok(self.approve_second)
        }
    }

    fn gate_with(
        unsafe_mode: bool,
        interactive: bool,
        validator: Option<Arc<dyn RiskValidator>>,
    ) -> SecurityGate {
        SecurityGate::new(
            SecurityConfig {
                unsafe_mode,
                llm_validation: validator.is_some(),
                interactive,
            },
            validator,
        )
    }

    #[tokio::test]
    async fn critical_block_applies_even_in_unsafe_mode() {
        let gate = gate_with(true, false, None);
        let d = gate.classify("shell_command", &shell_args("rm -rf /usr")).await;
        assert!(matches!(d, GateDecision::CriticalBlock(_)));
    }

    #[tokio::test]
    async fn unsafe_mode_skips_validator() {
        let validator = Arc::new(FixedValidator {
            assessment: RiskAssessment {
                should_block: true,
                ..Default::default()
            },
            approve_second: false,
            fail: false,
        });
        let gate = gate_with(true, false, Some(validator));
        let d = gate.classify("shell_command", &shell_args("cargo build")).await;
        assert_eq!(d, GateDecision::Allow);
    }

    #[tokio::test]
    async fn validator_block_is_fatal_for_the_call() {
        let validator = Arc::new(FixedValidator {
            assessment: RiskAssessment {
                should_block: true,
                reasoning: "destructive".into(),
                ..Default::default()
            },
            approve_second: false,
            fail: false,
        });
        let gate = gate_with(false, true, Some(validator));
        let d = gate.classify("shell_command", &shell_args("git push --force")).await;
        assert!(matches!(d, GateDecision::Block(r) if r.contains("destructive")));
    }

    #[tokio::test]
    async fn confirm_in_interactive_mode_surfaces_needs_confirm() {
        let validator = Arc::new(FixedValidator {
            assessment: RiskAssessment {
                should_confirm: true,
                ..Default::default()
            },
            approve_second: false,
            fail: false,
        });
        let gate = gate_with(false, true, Some(validator));
        let d = gate.classify("shell_command", &shell_args("cargo publish")).await;
        assert!(matches!(d, GateDecision::NeedsConfirm(_)));
    }

    #[tokio::test]
    async fn confirm_headless_uses_second_opinion_approval() {
        let validator = Arc::new(FixedValidator {
            assessment: RiskAssessment {
                should_confirm: true,
                ..Default::default()
            },
            approve_second: true,
            fail: false,
        });
        let gate = gate_with(false, false, Some(validator));
        let d = gate.classify("shell_command", &shell_args("cargo publish")).await;
        assert_eq!(d, GateDecision::Allow);
    }

    #[tokio::test]
    async fn confirm_headless_second_opinion_rejection_blocks() {
        let validator = Arc::new(FixedValidator {
            assessment: RiskAssessment {
                should_confirm: true,
                ..Default::default()
            },
            approve_second: false,
            fail: false,
        });
        let gate = gate_with(false, false, Some(validator));
        let d = gate.classify("shell_command", &shell_args("cargo publish")).await;
        assert!(matches!(d, GateDecision::Block(_)));
    }

    #[tokio::test]
    async fn validator_failure_fails_open() {
        let validator = Arc::new(FixedValidator {
            assessment: RiskAssessment::default(),
            approve_second: false,
            fail: true,
        });
        let gate = gate_with(false, false, Some(validator));
        let d = gate.classify("shell_command", &shell_args("ls")).await;
        assert_eq!(d, GateDecision::Allow);
    }

    // ── JSON extraction ───────────────────────────────────────────────────────

    #[test]
    fn parse_json_object_unwraps_fences() {
        let text = "Here you go:\n```json\n{\"approved\": true}\n```";
        let v = parse_json_object(text).unwrap();
        assert_eq!(v["approved"], json!(true));
    }

    #[test]
    fn parse_json_object_rejects_prose() {
        assert!(parse_json_object("definitely approved").is_none());
    }
}
