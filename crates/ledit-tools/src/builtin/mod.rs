// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod edit_file;
pub mod fetch_url;
pub mod list_dir;
pub mod read_file;
pub mod search_files;
pub mod shell_command;
pub mod write_file;

use std::path::{Component, Path, PathBuf};

use crate::capability::AgentOps;
use crate::registry::{ToolRegistry, FILE_SECURITY_PREFIX};

/// Register every built-in tool.  `shell_timeout_secs` comes from agent
/// config; everything else is self-contained.
pub fn install_builtin(reg: &mut ToolRegistry, shell_timeout_secs: u64) {
    reg.register(read_file::config());
    reg.register(write_file::config());
    reg.register(edit_file::config());
    reg.register(list_dir::config());
    reg.register(search_files::config());
    reg.register(shell_command::config(shell_timeout_secs));
    reg.register(fetch_url::config());
}

/// Resolve `path` relative to the agent workdir and verify containment.
///
/// Mutating tools call this before touching the filesystem; a path that
/// escapes the workdir produces an error with [`FILE_SECURITY_PREFIX`] so
/// the dispatcher can route it through the interactive bypass.  `bypass`
/// (the approved re-dispatch) skips the containment check but still
/// normalizes the path.
pub(crate) fn resolve_in_workdir(
    ops: &dyn AgentOps,
    path: &str,
    bypass: bool,
) -> anyhow::Result<PathBuf> {
    let workdir = ops.workdir();
    let joined = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        workdir.join(path)
    };
    let normalized = normalize(&joined);
    if !bypass && !normalized.starts_with(normalize(&workdir)) {
        anyhow::bail!(
            "{FILE_SECURITY_PREFIX}path '{}' is outside the working directory '{}'",
            normalized.display(),
            workdir.display()
        );
    }
    Ok(normalized)
}

/// Lexical normalization: resolves `.` and `..` components without touching
/// the filesystem, so containment checks work for paths that do not exist yet.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
