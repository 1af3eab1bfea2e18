// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// One tracked repeated action, keyed by `action_type:target`.
#[derive(Debug, Clone)]
pub struct CircuitBreakerAction {
    pub action_type: String,
    pub target: String,
    pub count: u32,
    pub last_used: DateTime<Utc>,
}

/// Per-`(action, target)` repetition counter.
///
/// Counters only grow within a session; `reset` is the explicit escape
/// hatch.  The breaker trips exactly when a counter reaches the threshold,
/// never before.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    actions: HashMap<String, CircuitBreakerAction>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            actions: HashMap::new(),
        }
    }

    /// Record one occurrence and return the guidance message when the
    /// breaker has tripped for this key.
    pub fn record(&mut self, action_type: &str, target: &str) -> Option<String> {
        let key = format!("{action_type}:{target}");
        let entry = self
            .actions
            .entry(key)
            .or_insert_with(|| CircuitBreakerAction {
                action_type: action_type.to_string(),
                target: target.to_string(),
                count: 0,
                last_used: Utc::now(),
            });
        entry.count += 1;
        entry.last_used = Utc::now();
        if entry.count >= self.threshold {
            Some(format!(
                "Circuit breaker: '{action_type}' on '{target}' has been attempted \
                 {} times without progress. Stop repeating this action. Re-read the \
                 task, summarize what you know so far, and plan a different approach.",
                entry.count
            ))
        } else {
            None
        }
    }

    pub fn count(&self, action_type: &str, target: &str) -> u32 {
        self.actions
            .get(&format!("{action_type}:{target}"))
            .map(|a| a.count)
            .unwrap_or(0)
    }

    /// Clear the counter for one key.
    pub fn reset(&mut self, action_type: &str, target: &str) {
        self.actions.remove(&format!("{action_type}:{target}"));
    }

    /// Clear all counters.
    pub fn reset_all(&mut self) {
        self.actions.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
