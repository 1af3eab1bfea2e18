// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::params::{ParamType, ParameterConfig, ValidatedArgs};
use crate::registry::{HandlerCtx, ToolConfig, ToolHandler};

const DEFAULT_MAX_CHARS: usize = 50_000;

pub fn config() -> ToolConfig {
    ToolConfig {
        name: "fetch_url",
        description: "Fetch content from an http/https URL and convert HTML \
                      to readable text. Read-only; no authentication; no \
                      localhost or private addresses; content capped at \
                      50,000 characters by default.",
        parameters: vec![
            ParameterConfig::required("url", ParamType::String, "Fully-formed http/https URL"),
            ParameterConfig::optional(
                "max_chars",
                ParamType::Int,
                "Character cap for the returned content (default 50000)",
            ),
        ],
        read_only: true,
        handler: Arc::new(FetchUrlHandler),
    }
}

struct FetchUrlHandler;

#[async_trait]
impl ToolHandler for FetchUrlHandler {
    async fn run(&self, _ctx: &HandlerCtx, args: &ValidatedArgs) -> anyhow::Result<String> {
        let url = args.str("url").unwrap_or_default().to_string();
        let max_chars = args
            .int("max_chars")
            .map(|n| n.max(1) as usize)
            .unwrap_or(DEFAULT_MAX_CHARS);

        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("only http/https URLs are supported: {url}");
        }
        if is_private_host(&url) {
            anyhow::bail!("refusing to fetch localhost/private address: {url}");
        }

        debug!(url = %url, "fetch_url tool");

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("client error: {e}"))?;
        let resp = client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("fetch error: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("fetch error: HTTP {status} for {url}");
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = resp
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("read error: {e}"))?;

        let text = if content_type.contains("text/html") {
            html2text::from_read(body.as_bytes(), 100)
        } else {
            body
        };

        if text.len() > max_chars {
            let mut cut = max_chars;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            Ok(format!(
                "{}\n...[truncated at {max_chars} chars of {}]",
                &text[..cut],
                text.len()
            ))
        } else {
            Ok(text)
        }
    }
}

/// Reject obvious loopback / private-network targets.  Not a full SSRF
/// defence — the agent runs with the user's own network access — just a
/// guard against pointing the model at internal services by accident.
fn is_private_host(url: &str) -> bool {
    let without_scheme = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .split('@')
        .last()
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("");
    host == "localhost"
        || host == "127.0.0.1"
        || host == "0.0.0.0"
        || host == "[::1]"
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || host.starts_with("169.254.")
        || is_172_private(host)
}

fn is_172_private(host: &str) -> bool {
    let Some(rest) = host.strip_prefix("172.") else {
        return false;
    };
    rest.split('.')
        .next()
        .and_then(|s| s.parse::<u8>().ok())
        .map(|second| (16..=31).contains(&second))
        .unwrap_or(false)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
