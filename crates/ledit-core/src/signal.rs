// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

/// Accepted spellings of the completion sentinel.  Matching is
/// case-insensitive; the canonical form is `[[TASK_COMPLETE]]`.
const COMPLETION_VARIANTS: &[&str] = &[
    "[[task_complete]]",
    "[[task complete]]",
    "[[taskcomplete]]",
];

/// Phrases that indicate the model is stuck in a loop rather than making
/// progress.  Matched case-insensitively against the trimmed content.
const STUCK_PHRASES: &[&str] = &[
    "i will now proceed",
    "let me try again",
    "as mentioned before",
    "i apologize for the confusion",
];

/// Byte-level ASCII-case-insensitive search.  The needles are pure ASCII,
/// so every match position is a valid char boundary in `haystack`.
fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.is_empty() || h.len() < n.len() {
        return None;
    }
    (0..=h.len() - n.len()).find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}

/// If the assistant turn contains a completion signal, return the content
/// with every variant stripped and trimmed.  Returns `None` otherwise.
pub fn strip_completion_signal(content: &str) -> Option<String> {
    let mut found = false;
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    loop {
        let earliest = COMPLETION_VARIANTS
            .iter()
            .filter_map(|v| find_ci(rest, v).map(|pos| (pos, v.len())))
            .min();
        match earliest {
            Some((pos, len)) => {
                found = true;
                out.push_str(&rest[..pos]);
                rest = &rest[pos + len..];
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    found.then(|| out.trim().to_string())
}

/// Blank-iteration rule: no tool calls AND the content is empty, a single
/// character, or at most 3 characters of punctuation/whitespace.
pub fn is_blank(content: &str) -> bool {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return true;
    }
    let count = trimmed.chars().count();
    if count == 1 {
        return true;
    }
    count <= 3 && trimmed.chars().all(|c| c.is_ascii_punctuation() || c.is_whitespace())
}

/// Repetitive-content rule: the content matches a stuck-loop phrase, equals
/// the previous assistant message (trimmed), or — for longer replies — any
/// single word over 3 chars makes up more than 30% of the tokens.
pub fn is_repetitive(content: &str, previous_assistant: Option<&str>) -> bool {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return false;
    }
    let lower = trimmed.to_lowercase();
    if STUCK_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    if let Some(prev) = previous_assistant {
        if !prev.trim().is_empty() && prev.trim() == trimmed {
            return true;
        }
    }

    let tokens: Vec<&str> = lower.split_whitespace().collect();
    if tokens.len() > 10 {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for t in &tokens {
            if t.chars().count() > 3 {
                *counts.entry(*t).or_default() += 1;
            }
        }
        let limit = tokens.len() * 3 / 10;
        if counts.values().any(|&c| c > limit) {
            return true;
        }
    }
    false
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
