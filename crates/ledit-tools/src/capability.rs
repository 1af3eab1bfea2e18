// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use async_trait::async_trait;

/// Capability interface the registry hands to tool handlers.
///
/// Handlers never hold the agent directly — this narrow surface is all they
/// can reach, which breaks the agent↔tool ownership cycle and keeps the
/// shared registry free of per-agent state.
#[async_trait]
pub trait AgentOps: Send + Sync {
    /// Record a human-readable action for session history / sub-agent
    /// context blocks.
    fn log_action(&self, action: &str);

    /// Register a file creation/overwrite with the change tracker.
    /// `old_content` is `None` for newly created files.
    fn track_file_write(&self, path: &str, old_content: Option<String>, new_content: &str);

    /// Register an in-place edit with the change tracker.
    fn track_file_edit(&self, path: &str, old_content: &str, new_content: &str);

    /// Record the latest read of a path for the context optimizer.
    fn record_file_read(&self, path: &str, content: &str);

    /// Record a shell command and its output for the context optimizer.
    fn record_shell_command(&self, command: &str, output: &str);

    /// The workspace directory tool file operations are confined to.
    fn workdir(&self) -> PathBuf;

    /// Ask the user to approve an operation.  Only consulted in interactive
    /// mode; implementations without a UI should return `false`.
    async fn confirm(&self, prompt: &str) -> bool;
}

/// No-op capability implementation for unit tests and detached tool use.
///
/// Confirms everything and records nothing; `workdir` is the process cwd.
#[derive(Default)]
pub struct NullOps;

#[async_trait]
impl AgentOps for NullOps {
    fn log_action(&self, _action: &str) {}
    fn track_file_write(&self, _path: &str, _old: Option<String>, _new: &str) {}
    fn track_file_edit(&self, _path: &str, _old: &str, _new: &str) {}
    fn record_file_read(&self, _path: &str, _content: &str) {}
    fn record_shell_command(&self, _command: &str, _output: &str) {}

    fn workdir(&self) -> PathBuf {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }

    async fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}
