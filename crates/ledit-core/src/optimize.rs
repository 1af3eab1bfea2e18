// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use ledit_model::{Message, Role};

/// Minimum index gap between an old tool result and the later identical one
/// before the old copy is collapsed.
const MIN_GAP: usize = 5;

/// Transient shell results older than this many messages are always
/// collapsed, changed or not.
const TRANSIENT_AGE: usize = 2;

/// Prose cap applied by aggressive optimization.
const AGGRESSIVE_PROSE_CHARS: usize = 800;

/// Tail window that aggressive optimization leaves untouched.
const KEEP_RECENT: usize = 5;

/// Exploratory commands whose output goes stale immediately.
const TRANSIENT_COMMANDS: &[&str] = &[
    "ls", "find", "pwd", "grep", "ps", "df", "du", "which", "stat",
];

/// Latest observed read of one path.
#[derive(Debug, Clone)]
pub struct FileReadRecord {
    pub path: String,
    pub content_hash: String,
    pub message_index: usize,
    pub timestamp: DateTime<Utc>,
}

/// Latest observed run of one shell command.
#[derive(Debug, Clone)]
pub struct ShellCommandRecord {
    pub command: String,
    pub content_hash: String,
    pub message_index: usize,
    pub is_transient: bool,
    pub timestamp: DateTime<Utc>,
}

/// True for commands whose first word is a pure inspection tool.
pub fn is_transient_command(command: &str) -> bool {
    command
        .split_whitespace()
        .next()
        .map(|first| {
            let base = first.rsplit('/').next().unwrap_or(first);
            TRANSIENT_COMMANDS.contains(&base)
        })
        .unwrap_or(false)
}

fn hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `(tool name, parsed args)` for every tool-call id in the conversation.
fn call_index(messages: &[Message]) -> HashMap<String, (String, Value)> {
    let mut index = HashMap::new();
    for msg in messages {
        for tc in &msg.tool_calls {
            let args: Value =
                serde_json::from_str(&tc.function.arguments).unwrap_or(Value::Null);
            index.insert(tc.id.clone(), (tc.function.name.clone(), args));
        }
    }
    index
}

fn str_arg(args: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| args.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn already_optimized(content: &str) -> bool {
    content.contains("[OPTIMIZED]") || content.contains("[COMPACT]")
}

/// Two-pass optimization: track the latest read of each path / run of each
/// command, then collapse older duplicates into compact markers.
///
/// Messages are rewritten in place — never dropped — and `role`,
/// `tool_call_id`, and `reasoning_content` survive untouched, so message
/// indices and call-id linkage remain valid downstream.
pub fn optimize(messages: &mut [Message]) -> usize {
    let calls = call_index(messages);
    let total = messages.len();

    // Pass 1: latest record per path / command.
    let mut file_reads: HashMap<String, FileReadRecord> = HashMap::new();
    let mut shell_runs: HashMap<String, ShellCommandRecord> = HashMap::new();
    for (i, msg) in messages.iter().enumerate() {
        if msg.role != Role::Tool {
            continue;
        }
        let Some(id) = msg.tool_call_id.as_deref() else {
            continue;
        };
        let Some((name, args)) = calls.get(id) else {
            continue;
        };
        match name.as_str() {
            "read_file" => {
                if let Some(path) = str_arg(args, &["path", "file_path", "filename"]) {
                    file_reads.insert(
                        path.clone(),
                        FileReadRecord {
                            path,
                            content_hash: hash(&msg.content),
                            message_index: i,
                            timestamp: Utc::now(),
                        },
                    );
                }
            }
            "shell_command" => {
                if let Some(command) = str_arg(args, &["command", "cmd"]) {
                    let is_transient = is_transient_command(&command);
                    shell_runs.insert(
                        command.clone(),
                        ShellCommandRecord {
                            command,
                            content_hash: hash(&msg.content),
                            message_index: i,
                            is_transient,
                            timestamp: Utc::now(),
                        },
                    );
                }
            }
            _ => {}
        }
    }

    // Pass 2: rewrite older duplicates.
    let mut rewritten = 0usize;
    for (i, msg) in messages.iter_mut().enumerate() {
        if msg.role != Role::Tool || already_optimized(&msg.content) {
            continue;
        }
        let Some(id) = msg.tool_call_id.as_deref() else {
            continue;
        };
        let Some((name, args)) = calls.get(id) else {
            continue;
        };
        match name.as_str() {
            "read_file" => {
                let Some(path) = str_arg(args, &["path", "file_path", "filename"]) else {
                    continue;
                };
                let Some(record) = file_reads.get(&path) else {
                    continue;
                };
                if record.message_index > i
                    && record.message_index - i >= MIN_GAP
                    && record.content_hash == hash(&msg.content)
                {
                    let lines = msg.content.lines().count();
                    let chars = msg.content.len();
                    msg.content = format!(
                        "Tool call result for read_file: {path}\n[OPTIMIZED] Previously \
                         read file ({lines} lines, {chars} chars) - content unchanged \
                         since last read"
                    );
                    rewritten += 1;
                }
            }
            "shell_command" => {
                let Some(command) = str_arg(args, &["command", "cmd"]) else {
                    continue;
                };
                let Some(record) = shell_runs.get(&command) else {
                    continue;
                };
                let lines = msg.content.lines().count();
                let chars = msg.content.len();
                let duplicate_later = record.message_index > i
                    && record.message_index - i >= MIN_GAP
                    && record.content_hash == hash(&msg.content);
                let stale_transient =
                    record.is_transient && total.saturating_sub(i + 1) > TRANSIENT_AGE;
                if duplicate_later {
                    msg.content = format!(
                        "Tool call result for shell_command: {command}\n[OPTIMIZED] \
                         Previously run command ({lines} lines, {chars} chars) - output \
                         unchanged since last run"
                    );
                    rewritten += 1;
                } else if stale_transient {
                    msg.content = format!(
                        "Tool call result for shell_command: {command}\n[OPTIMIZED] \
                         Transient command output elided ({lines} lines, {chars} chars) \
                         - re-run if needed"
                    );
                    rewritten += 1;
                }
            }
            _ => {}
        }
    }
    rewritten
}

/// Aggressive optimization, invoked by the pruner when the token budget is
/// blown.  The first user message and the last [`KEEP_RECENT`] messages are
/// left byte-identical; every middle tool result becomes a `[COMPACT]`
/// marker and middle prose is truncated to 800 chars.
pub fn aggressive_optimize(messages: &mut [Message]) -> usize {
    let total = messages.len();
    if total <= KEEP_RECENT {
        return 0;
    }
    let first_user = messages.iter().position(|m| m.role == Role::User);
    let tail_start = total - KEEP_RECENT;

    let mut rewritten = 0usize;
    for (i, msg) in messages.iter_mut().enumerate() {
        if i >= tail_start || msg.role == Role::System {
            continue;
        }
        if Some(i) == first_user {
            continue; // the original user request is an anchor
        }
        match msg.role {
            Role::Tool => {
                if !msg.content.starts_with("[COMPACT]") {
                    msg.content = format!("[COMPACT] Tool result ({} chars)", msg.content.len());
                    rewritten += 1;
                }
            }
            _ => {
                if msg.content.len() > AGGRESSIVE_PROSE_CHARS {
                    let mut cut = AGGRESSIVE_PROSE_CHARS;
                    while !msg.content.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    msg.content.truncate(cut);
                    msg.content.push_str("\n[TRUNCATED for context]");
                    rewritten += 1;
                }
            }
        }
    }
    rewritten
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
