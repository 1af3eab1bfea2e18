// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;

use crate::params::{ParamType, ParameterConfig, ValidatedArgs};
use crate::registry::{HandlerCtx, ToolConfig, ToolHandler};

pub fn config() -> ToolConfig {
    ToolConfig {
        name: "list_dir",
        description: "List the entries of a directory, sorted by name. \
                      Directories carry a trailing '/'.",
        parameters: vec![ParameterConfig::optional(
            "path",
            ParamType::String,
            "Directory to list (default: current directory)",
        )
        .with_aliases(&["dir", "directory"])],
        read_only: true,
        handler: Arc::new(ListDirHandler),
    }
}

struct ListDirHandler;

#[async_trait]
impl ToolHandler for ListDirHandler {
    async fn run(&self, _ctx: &HandlerCtx, args: &ValidatedArgs) -> anyhow::Result<String> {
        let path = args.str("path").unwrap_or(".").to_string();

        let mut rd = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| anyhow::anyhow!("list error: {path}: {e}"))?;

        let mut entries: Vec<String> = Vec::new();
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| anyhow::anyhow!("list error: {path}: {e}"))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();

        if entries.is_empty() {
            Ok(format!("{path}: empty directory"))
        } else {
            Ok(entries.join("\n"))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::capability::NullOps;
    use crate::params::validate_args;

    async fn run(args: serde_json::Value) -> anyhow::Result<String> {
        let cfg = config();
        let validated = validate_args(&cfg.parameters, &args).unwrap();
        let ctx = HandlerCtx {
            ops: Arc::new(NullOps),
            security_bypass: false,
        };
        cfg.handler.run(&ctx, &validated).await
    }

    #[tokio::test]
    async fn lists_sorted_with_dir_markers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        let out = run(json!({"path": dir.path()})).await.unwrap();
        assert_eq!(out, "a/\nb.txt");
    }

    #[tokio::test]
    async fn empty_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let out = run(json!({"path": dir.path()})).await.unwrap();
        assert!(out.contains("empty directory"));
    }

    #[tokio::test]
    async fn missing_directory_is_error() {
        let err = run(json!({"path": "/tmp/ledit_no_such_dir_xyz"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("list error"));
    }
}
