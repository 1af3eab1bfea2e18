// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;

use ledit_model::{Message, Role};
use tracing::{debug, warn};

use crate::optimize;

/// Fraction of the budget at which the one-shot warning fires.
const WARN_FRACTION: f64 = 0.8;

/// Headroom multiplier: up to budget × 1.1 the normal optimizer is enough.
const SOFT_OVERFLOW: f64 = 1.1;

/// Tail window never dropped by the middle-drop pass.
const KEEP_RECENT: usize = 5;

/// What the pruner ended up doing to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneAction {
    Unchanged,
    Optimized,
    Aggressive,
    /// Aggressive pass plus this many middle messages dropped.
    Dropped(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct PruneReport {
    pub action: PruneAction,
    pub estimated_before: usize,
    pub estimated_after: usize,
    /// Set the first time the session crosses 80% of budget.
    pub warning: bool,
}

/// Enforces the token budget on outgoing requests.
///
/// Stateful only for the one-shot 80% warning; everything else is a pure
/// function of the message list.
#[derive(Debug, Default)]
pub struct Pruner {
    warned: bool,
}

/// Characters-per-token divisor for a model family.  chars/4 is the common
/// default; families with denser tokenizers get their own estimate.
fn chars_per_token(family: &str) -> f64 {
    let f = family.to_lowercase();
    if f.contains("claude") || f.contains("anthropic") {
        3.5
    } else if f.contains("gemini") || f.contains("google") {
        4.2
    } else {
        4.0
    }
}

/// Estimate total tokens across all messages: content plus reasoning
/// characters divided by the family divisor.
pub fn estimate_tokens(messages: &[Message], family: &str) -> usize {
    let chars: usize = messages.iter().map(Message::approx_chars).sum();
    (chars as f64 / chars_per_token(family)).ceil() as usize
}

impl Pruner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enforce `budget` on `messages` (the full request list, system prompt
    /// included).  Applies the normal-optimize → aggressive → middle-drop
    /// ladder; the system message, the original user request, and the
    /// trailing window are never dropped.
    pub fn enforce(
        &mut self,
        messages: &mut Vec<Message>,
        budget: usize,
        family: &str,
    ) -> PruneReport {
        let estimated_before = estimate_tokens(messages, family);
        let warning = if !self.warned
            && budget > 0
            && (estimated_before as f64) > (budget as f64) * WARN_FRACTION
        {
            self.warned = true;
            warn!(
                estimated = estimated_before,
                budget, "context usage crossed 80% of budget"
            );
            true
        } else {
            false
        };

        if budget == 0 || estimated_before <= budget {
            return PruneReport {
                action: PruneAction::Unchanged,
                estimated_before,
                estimated_after: estimated_before,
                warning,
            };
        }

        // Soft overflow (≤ 1.1× budget): the normal optimizer alone is the
        // proportionate response; harder measures wait for the next turn.
        if (estimated_before as f64) <= (budget as f64) * SOFT_OVERFLOW {
            optimize::optimize(messages);
            let estimated_after = estimate_tokens(messages, family);
            return PruneReport {
                action: PruneAction::Optimized,
                estimated_before,
                estimated_after,
                warning,
            };
        }

        optimize::optimize(messages);
        optimize::aggressive_optimize(messages);
        let mut estimated_after = estimate_tokens(messages, family);
        if estimated_after <= budget {
            return PruneReport {
                action: PruneAction::Aggressive,
                estimated_before,
                estimated_after,
                warning,
            };
        }

        let dropped = drop_middle(messages, budget, family);
        estimated_after = estimate_tokens(messages, family);
        debug!(dropped, estimated_after, "pruner dropped middle messages");
        PruneReport {
            action: PruneAction::Dropped(dropped),
            estimated_before,
            estimated_after,
            warning,
        }
    }
}

/// Drop messages from the middle, oldest first, until under budget.
///
/// Invariants: the system message, the first user message, and the trailing
/// window survive untouched.  The window is the last [`KEEP_RECENT`]
/// messages, extended backward so it never starts in the middle of a tool
/// call/response group.  After dropping, tool results whose originating
/// assistant call was dropped are swept from the droppable prefix so every
/// surviving tool message still has its matching call upstream.
fn drop_middle(messages: &mut Vec<Message>, budget: usize, family: &str) -> usize {
    let mut dropped = 0usize;

    loop {
        if estimate_tokens(messages, family) <= budget {
            break;
        }
        // Recomputed per iteration: removals shift positions.
        let first_user = messages.iter().position(|m| m.role == Role::User);
        let tail_start = protected_tail_start(messages);
        let candidate = (0..tail_start)
            .find(|&i| messages[i].role != Role::System && Some(i) != first_user);
        match candidate {
            Some(i) => {
                messages.remove(i);
                dropped += 1;
            }
            None => break, // nothing left that may be dropped
        }
    }

    // Sweep orphaned tool results.  Removals only ever happen ahead of the
    // protected window, so orphans can only exist there; the window itself
    // is never touched.
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut i = 0;
    while i < protected_tail_start(messages) {
        for tc in &messages[i].tool_calls {
            seen_ids.insert(tc.id.clone());
        }
        let orphan = messages[i].role == Role::Tool
            && messages[i]
                .tool_call_id
                .as_ref()
                .map(|id| !seen_ids.contains(id))
                .unwrap_or(true);
        if orphan {
            messages.remove(i);
            dropped += 1;
        } else {
            i += 1;
        }
    }

    dropped
}

/// Start of the protected trailing window.
///
/// Nominally `len - KEEP_RECENT`, walked backward while it points at a
/// `tool` message: tool results immediately follow the assistant message
/// that requested them, so landing inside a group would let the drop loop
/// delete the owning assistant and strand its results inside the window.
/// Walking back to the nearest non-tool message keeps every call/response
/// group intact.
fn protected_tail_start(messages: &[Message]) -> usize {
    let mut tail_start = messages.len().saturating_sub(KEEP_RECENT);
    while tail_start > 0 && messages[tail_start].role == Role::Tool {
        tail_start -= 1;
    }
    tail_start
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
