// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0

/// Classified result of dispatching one tool call.
///
/// The conversation driver switches on the variant to decide whether to
/// append a tool message (and keep looping), inject guidance, or abort.
/// Everything except `Ok` represents a failure the *model* is expected to
/// act on — none of these are driver-level errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    /// Handler ran and produced output.
    Ok(String),
    /// Arguments failed validation (missing required, type mismatch).
    Validation(String),
    /// Handler ran and returned an error.
    Handler(String),
    /// The security gate (LLM validator or policy) refused the call.
    SecurityBlock(String),
    /// The hard critical-operation predicate refused the call.  Never
    /// bypassable, including in unsafe mode.
    CriticalBlock(String),
    /// The call was cancelled before the handler ran.
    Cancelled,
}

impl ToolOutcome {
    /// Render this outcome as the content of the `tool` message appended to
    /// the conversation.  Error shapes carry recognizable prefixes so the
    /// model (and the sub-agent summary extractor) can classify them.
    pub fn into_message_content(self) -> String {
        match self {
            ToolOutcome::Ok(out) => out,
            ToolOutcome::Validation(msg) => format!("Tool validation failed: {msg}"),
            ToolOutcome::Handler(msg) => format!("Tool execution failed: {msg}"),
            ToolOutcome::SecurityBlock(reason) => {
                format!("Security block: {reason}. Choose a different approach.")
            }
            ToolOutcome::CriticalBlock(reason) => {
                format!("CRITICAL: operation blocked: {reason}. This action is never permitted.")
            }
            ToolOutcome::Cancelled => "Tool call cancelled before execution.".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutcome::Ok(_))
    }

    /// True for the two security-originated refusals.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            ToolOutcome::SecurityBlock(_) | ToolOutcome::CriticalBlock(_)
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
