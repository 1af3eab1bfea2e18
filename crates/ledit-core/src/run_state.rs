// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Relative path of the checkpoint file inside the workspace.
const RUN_STATE_FILE: &str = ".ledit/run_state.json";

/// Resumable subset of agent state.
///
/// Deliberately not a full snapshot: the message list is reconstructed from
/// the conversation log, so only counters and outcome bookkeeping live here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    /// The user's original request for this run.
    pub intent: String,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub total_tokens: u64,
    pub total_cost: f64,
    /// Human-readable log of operations performed (tool calls, file writes).
    #[serde(default)]
    pub executed_operations: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Outcome of validation steps keyed by name ("build", "test", ...).
    #[serde(default)]
    pub validation_results: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn state_path(workdir: &Path) -> PathBuf {
    workdir.join(RUN_STATE_FILE)
}

/// Persist `state` to `.ledit/run_state.json` under `workdir`.
///
/// Checkpoint I/O failures are logged and swallowed — a checkpoint must
/// never take down a run.
pub fn save(workdir: &Path, state: &RunState) {
    let path = state_path(workdir);
    let mut state = state.clone();
    state.updated_at = Some(Utc::now());
    let write = || -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&state)?;
        std::fs::write(&path, json)?;
        Ok(())
    };
    match write() {
        Ok(()) => debug!(path = %path.display(), "run state saved"),
        Err(e) => warn!(path = %path.display(), error = %e, "run state save failed"),
    }
}

/// Load the checkpoint, if one exists and parses.  Corrupt files are
/// reported and treated as absent.
pub fn load(workdir: &Path) -> Option<RunState> {
    let path = state_path(workdir);
    let text = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&text) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "run state unreadable; ignoring");
            None
        }
    }
}

pub fn has(workdir: &Path) -> bool {
    state_path(workdir).is_file()
}

pub fn clear(workdir: &Path) {
    let path = state_path(workdir);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "run state clear failed");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
