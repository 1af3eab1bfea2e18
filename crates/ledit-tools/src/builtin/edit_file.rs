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
        name: "edit_file",
        description: "Replace an exact text fragment in a file. old_str must \
                      appear exactly once; include enough surrounding context \
                      to make it unique. The previous content is recorded so \
                      the change can be rolled back.",
        parameters: vec![
            ParameterConfig::required("path", ParamType::String, "Path to the file")
                .with_aliases(&["file_path", "filename"]),
            ParameterConfig::required("old_str", ParamType::String, "Exact text to replace")
                .with_aliases(&["old_string", "old_text"]),
            ParameterConfig::required("new_str", ParamType::String, "Replacement text")
                .with_aliases(&["new_string", "new_text"]),
        ],
        read_only: false,
        handler: Arc::new(EditFileHandler),
    }
}

struct EditFileHandler;

#[async_trait]
impl ToolHandler for EditFileHandler {
    async fn run(&self, ctx: &HandlerCtx, args: &ValidatedArgs) -> anyhow::Result<String> {
        let path = args.str("path").unwrap_or_default().to_string();
        let old_str = args.str("old_str").unwrap_or_default();
        let new_str = args.str("new_str").unwrap_or_default();

        if old_str.is_empty() {
            anyhow::bail!("old_str must not be empty");
        }

        let resolved = resolve_in_workdir(ctx.ops.as_ref(), &path, ctx.security_bypass)?;
        debug!(path = %resolved.display(), "edit_file tool");

        let original = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| anyhow::anyhow!("read error: {path}: {e}"))?;

        let occurrences = original.matches(old_str).count();
        if occurrences == 0 {
            anyhow::bail!("old_str not found in {path}");
        }
        if occurrences > 1 {
            anyhow::bail!(
                "old_str appears {occurrences} times in {path}; \
                 include more context to make it unique"
            );
        }

        let updated = original.replacen(old_str, new_str, 1);
        tokio::fs::write(&resolved, &updated)
            .await
            .map_err(|e| anyhow::anyhow!("write error: {}: {e}", resolved.display()))?;

        ctx.ops.track_file_edit(&path, &original, &updated);
        ctx.ops.log_action(&format!("Modified: {path}"));

        Ok(format!(
            "Modified: {path} (replaced {} chars with {} chars)",
            old_str.len(),
            new_str.len()
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
