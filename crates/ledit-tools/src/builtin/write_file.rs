// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::resolve_in_workdir;
use crate::params::{ParamType, ParameterConfig, ValidatedArgs};
use crate::registry::{HandlerCtx, ToolConfig, ToolHandler};

pub fn config() -> ToolConfig {
    ToolConfig {
        name: "write_file",
        description: "Create or overwrite a file with the given content. \
                      Parent directories are created as needed. The previous \
                      content (if any) is recorded so the change can be \
                      rolled back.",
        parameters: vec![
            ParameterConfig::required("path", ParamType::String, "Path to the file")
                .with_aliases(&["file_path", "filename"]),
            ParameterConfig::required("content", ParamType::String, "Full new file content")
                .with_aliases(&["contents", "text"]),
        ],
        read_only: false,
        handler: Arc::new(WriteFileHandler),
    }
}

struct WriteFileHandler;

#[async_trait]
impl ToolHandler for WriteFileHandler {
    async fn run(&self, ctx: &HandlerCtx, args: &ValidatedArgs) -> anyhow::Result<String> {
        let path = args.str("path").unwrap_or_default().to_string();
        let content = args.str("content").unwrap_or_default().to_string();

        let resolved = resolve_in_workdir(ctx.ops.as_ref(), &path, ctx.security_bypass)?;
        debug!(path = %resolved.display(), bytes = content.len(), "write_file tool");

        let old_content = tokio::fs::read_to_string(&resolved).await.ok();

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| anyhow::anyhow!("create dir error: {e}"))?;
        }
        tokio::fs::write(&resolved, &content)
            .await
            .map_err(|e| anyhow::anyhow!("write error: {}: {e}", resolved.display()))?;

        let verb = if old_content.is_some() { "Updated" } else { "Created" };
        ctx.ops.track_file_write(&path, old_content, &content);
        ctx.ops.log_action(&format!("{verb}: {path}"));

        Ok(format!("{verb}: {path} ({} bytes)", content.len()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
