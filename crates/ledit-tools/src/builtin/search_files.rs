// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use crate::params::{ParamType, ParameterConfig, ValidatedArgs};
use crate::registry::{HandlerCtx, ToolConfig, ToolHandler};

const DEFAULT_MAX_RESULTS: usize = 100;

/// Directories that are never worth searching.
const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", ".venv", "__pycache__"];

/// Per-file byte ceiling; larger files are skipped rather than scanned.
const MAX_FILE_BYTES: u64 = 2_000_000;

pub fn config() -> ToolConfig {
    ToolConfig {
        name: "search_files",
        description: "Search file contents under a directory with a regular \
                      expression. Returns 'path:line: text' matches, leading \
                      matches first. Binary files, .git, target and similar \
                      directories are skipped.",
        parameters: vec![
            ParameterConfig::required("pattern", ParamType::String, "Regular expression")
                .with_aliases(&["query", "regex"]),
            ParameterConfig::optional(
                "path",
                ParamType::String,
                "Directory to search (default: current directory)",
            )
            .with_aliases(&["dir", "directory"]),
            ParameterConfig::optional(
                "max_results",
                ParamType::Int,
                "Maximum matches to return (default 100)",
            ),
        ],
        read_only: true,
        handler: Arc::new(SearchFilesHandler),
    }
}

struct SearchFilesHandler;

#[async_trait]
impl ToolHandler for SearchFilesHandler {
    async fn run(&self, _ctx: &HandlerCtx, args: &ValidatedArgs) -> anyhow::Result<String> {
        let pattern = args.str("pattern").unwrap_or_default().to_string();
        let root = args.str("path").unwrap_or(".").to_string();
        let max_results = args
            .int("max_results")
            .map(|n| n.max(1) as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS);

        let re = Regex::new(&pattern).map_err(|e| anyhow::anyhow!("invalid pattern: {e}"))?;
        debug!(pattern = %pattern, root = %root, "search_files tool");

        // walkdir is synchronous; run the scan on the blocking pool so the
        // agent loop is not stalled by a large tree.
        let result = tokio::task::spawn_blocking(move || scan(&root, &re, max_results))
            .await
            .map_err(|e| anyhow::anyhow!("search task failed: {e}"))??;
        Ok(result)
    }
}

fn scan(root: &str, re: &Regex, max_results: usize) -> anyhow::Result<String> {
    if !Path::new(root).exists() {
        anyhow::bail!("search error: {root}: no such directory");
    }

    let mut matches: Vec<String> = Vec::new();
    let mut truncated = false;

    let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
        let name = e.file_name().to_string_lossy();
        !(e.file_type().is_dir() && SKIP_DIRS.contains(&name.as_ref()))
    });

    'outer: for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.metadata().map(|m| m.len()).unwrap_or(0) > MAX_FILE_BYTES {
            continue;
        }
        let Ok(bytes) = std::fs::read(entry.path()) else {
            continue;
        };
        if bytes.contains(&0u8) {
            continue; // binary
        }
        let text = String::from_utf8_lossy(&bytes);
        for (i, line) in text.lines().enumerate() {
            if re.is_match(line) {
                if matches.len() >= max_results {
                    truncated = true;
                    break 'outer;
                }
                matches.push(format!("{}:{}: {}", entry.path().display(), i + 1, line.trim_end()));
            }
        }
    }

    if matches.is_empty() {
        return Ok("no matches".to_string());
    }
    let mut out = matches.join("\n");
    if truncated {
        out.push_str(&format!(
            "\n...[more matches exist; showing the first {max_results} — \
             use a more specific pattern]"
        ));
    }
    Ok(out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
