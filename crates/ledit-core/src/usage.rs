// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use ledit_model::Usage;

/// Session-wide token and cost accounting.
///
/// Both model responses and sub-agent metrics flow through the same
/// attribution path, so the session total is always the sum of per-response
/// estimated costs plus the sub-agents' reported costs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageTotals {
    pub total_cost: f64,
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cached_tokens: u64,
    /// Estimated savings from prompt-cache hits: cached tokens priced at
    /// 90% off the session's average cost per token.
    pub cached_savings: f64,
}

impl UsageTotals {
    pub fn attribute(&mut self, usage: &Usage) {
        self.attribute_raw(
            usage.prompt_tokens,
            usage.completion_tokens,
            usage.total_tokens,
            usage.estimated_cost,
            usage.cached_tokens,
        );
    }

    pub fn attribute_raw(
        &mut self,
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
        cost: f64,
        cached_tokens: u64,
    ) {
        self.prompt_tokens += prompt_tokens;
        self.completion_tokens += completion_tokens;
        self.total_tokens += total_tokens;
        self.total_cost += cost;
        self.cached_tokens += cached_tokens;
        if cached_tokens > 0 && self.total_tokens > 0 {
            let avg_cost_per_token = self.total_cost / self.total_tokens as f64;
            self.cached_savings += cached_tokens as f64 * avg_cost_per_token * 0.9;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
