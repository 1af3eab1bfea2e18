// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::params::{ParamType, ParameterConfig, ValidatedArgs};
use crate::registry::{HandlerCtx, ToolConfig, ToolHandler};

/// Default number of lines returned when the caller does not specify a limit.
const DEFAULT_LINE_LIMIT: usize = 2000;

/// Hard byte ceiling applied in addition to the line limit.
/// Whichever constraint is hit first determines where the output is cut.
const MAX_BYTES: usize = 64_000;

pub fn config() -> ToolConfig {
    ToolConfig {
        name: "read_file",
        description: "Read a file and return its contents. Optional offset \
                      (1-indexed start line) and limit (line count) paginate \
                      large files; a notice shows the next offset when more \
                      lines exist.",
        parameters: vec![
            ParameterConfig::required("path", ParamType::String, "Path to the file")
                .with_aliases(&["file_path", "filename"]),
            ParameterConfig::optional(
                "offset",
                ParamType::Int,
                "1-indexed line number to start reading from (default 1)",
            ),
            ParameterConfig::optional(
                "limit",
                ParamType::Int,
                "Maximum number of lines to return",
            ),
        ],
        read_only: true,
        handler: Arc::new(ReadFileHandler),
    }
}

struct ReadFileHandler;

#[async_trait]
impl ToolHandler for ReadFileHandler {
    async fn run(&self, ctx: &HandlerCtx, args: &ValidatedArgs) -> anyhow::Result<String> {
        let path = args.str("path").unwrap_or_default().to_string();
        let offset = args.int("offset").unwrap_or(1).max(1) as usize;
        let limit = args
            .int("limit")
            .map(|l| l.max(0) as usize)
            .unwrap_or(DEFAULT_LINE_LIMIT);

        debug!(path = %path, offset, limit, "read_file tool");

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read error: {path}: {e}"))?;
        let text = String::from_utf8_lossy(&bytes);

        let all_lines: Vec<&str> = text.lines().collect();
        let total = all_lines.len();
        let start = offset - 1;

        // Whole small file with default paging: return it verbatim so the
        // result round-trips byte-for-byte into the conversation.
        if start == 0 && total <= limit && bytes.len() <= MAX_BYTES {
            let content = text.into_owned();
            ctx.ops.record_file_read(&path, &content);
            return Ok(content);
        }

        let mut selected: Vec<&str> = Vec::new();
        let mut byte_count = 0usize;
        let mut truncated_by_bytes = false;
        for line in all_lines.iter().skip(start).take(limit) {
            let needed = line.len() + 1;
            if byte_count + needed > MAX_BYTES {
                truncated_by_bytes = true;
                break;
            }
            selected.push(line);
            byte_count += needed;
        }

        let last_shown = start + selected.len();
        let mut content = selected.join("\n");
        if last_shown < total {
            let reason = if truncated_by_bytes {
                format!("byte limit ({MAX_BYTES} B) reached")
            } else {
                format!("{} more lines", total - last_shown)
            };
            content.push_str(&format!(
                "\n...[{reason} — showing lines {offset}-{last_shown} of {total}; \
                 use offset={} to continue]",
                last_shown + 1
            ));
        }

        ctx.ops.record_file_read(&path, &content);
        Ok(content)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
