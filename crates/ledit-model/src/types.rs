// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

/// A single message in the conversation history.
///
/// The message list *is* the conversation state: messages are appended on
/// every user/assistant/tool turn and are never removed, only rewritten in
/// place by the context optimizer.  Rewrites replace `content` and must
/// preserve `role`, `tool_call_id`, and `reasoning_content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool invocations requested by an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For `Role::Tool` messages: the id of the call this result answers.
    /// Every tool message must be preceded by an assistant message whose
    /// `tool_calls` contains the matching id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Extended-thinking output carried alongside the visible content.
    /// Preserved byte-for-byte through optimization and pruning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text)
    }

    /// An assistant turn that requests tool calls alongside optional text.
    pub fn assistant_with_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls,
            tool_call_id: None,
            reasoning_content: None,
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(id.into()),
            reasoning_content: None,
        }
    }

    fn plain(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            reasoning_content: None,
        }
    }

    /// Character count that participates in token estimation: visible
    /// content plus reasoning, plus the serialized size of any tool calls.
    pub fn approx_chars(&self) -> usize {
        let call_chars: usize = self
            .tool_calls
            .iter()
            .map(|tc| tc.function.name.len() + tc.function.arguments.len())
            .sum();
        self.content.len()
            + self.reasoning_content.as_deref().map_or(0, str::len)
            + call_chars
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

// ─── Tool call types ──────────────────────────────────────────────────────────

/// A structured request from the model to invoke a named handler.
///
/// Ids are unique within a conversation.  `arguments` is always a
/// JSON-encoded object, `"{}"` when the call takes none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_call_type() -> String {
    "function".into()
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: function_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object
    pub arguments: String,
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

// ─── Request / response ───────────────────────────────────────────────────────

/// Request sent to an LLM client.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    /// Provider-specific reasoning/effort hint ("low", "medium", "high").
    pub reasoning_hint: Option<String>,
    /// Stream text deltas through the client's sink while aggregating the
    /// final response.  The returned response is identical either way.
    pub stream: bool,
}

/// Aggregated response from one completion call.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl ChatResponse {
    /// Convenience: a single-choice text response.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            choices: vec![Choice {
                message: ResponseMessage {
                    content: content.into(),
                    reasoning_content: None,
                    tool_calls: Vec::new(),
                },
            }],
            usage: Usage::default(),
        }
    }

    /// Convenience: a single-choice response carrying tool calls.
    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            choices: vec![Choice {
                message: ResponseMessage {
                    content: content.into(),
                    reasoning_content: None,
                    tool_calls,
                },
            }],
            usage: Usage::default(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// The first choice's message, if any.
    pub fn message(&self) -> Option<&ResponseMessage> {
        self.choices.first().map(|c| &c.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Choice {
    pub message: ResponseMessage,
}

#[derive(Debug, Clone, Default)]
pub struct ResponseMessage {
    pub content: String,
    pub reasoning_content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

/// Token usage and cost from one completion call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Provider-estimated cost in USD for this response.
    pub estimated_cost: f64,
    /// Prompt tokens served from the provider's cache.
    pub cached_tokens: u64,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.content, "hello");
        assert!(m.tool_calls.is_empty());
    }

    #[test]
    fn message_tool_result_carries_call_id() {
        let m = Message::tool_result("id-1", "output");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("id-1"));
        assert_eq!(m.content, "output");
    }

    #[test]
    fn assistant_with_calls_keeps_both_text_and_calls() {
        let m = Message::assistant_with_calls(
            "reading",
            vec![ToolCall::new("c1", "read_file", r#"{"path":"x"}"#)],
        );
        assert_eq!(m.content, "reading");
        assert_eq!(m.tool_calls.len(), 1);
        assert_eq!(m.tool_calls[0].function.name, "read_file");
    }

    #[test]
    fn tool_call_defaults_to_function_type() {
        let tc = ToolCall::new("id", "shell_command", "{}");
        assert_eq!(tc.call_type, "function");
    }

    // ── Character accounting ──────────────────────────────────────────────────

    #[test]
    fn approx_chars_counts_content() {
        let m = Message::user("12345678");
        assert_eq!(m.approx_chars(), 8);
    }

    #[test]
    fn approx_chars_includes_reasoning() {
        let mut m = Message::assistant("abcd");
        m.reasoning_content = Some("efgh".into());
        assert_eq!(m.approx_chars(), 8);
    }

    #[test]
    fn approx_chars_includes_tool_call_payload() {
        let m = Message::assistant_with_calls("", vec![ToolCall::new("id", "aaaa", "bbbbbbbb")]);
        assert_eq!(m.approx_chars(), 12);
    }

    // ── Serialisation round-trip ──────────────────────────────────────────────

    #[test]
    fn message_serialises_and_deserialises() {
        let original = Message::tool_result("call-9", "payload");
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.role, Role::Tool);
        assert_eq!(decoded.tool_call_id.as_deref(), Some("call-9"));
    }

    #[test]
    fn empty_tool_calls_are_omitted_from_json() {
        let json = serde_json::to_string(&Message::user("x")).unwrap();
        assert!(!json.contains("tool_calls"), "empty list must not serialize: {json}");
    }

    #[test]
    fn tool_call_type_field_round_trips_as_type() {
        let tc = ToolCall::new("a", "b", "{}");
        let json = serde_json::to_string(&tc).unwrap();
        assert!(json.contains("\"type\":\"function\""), "{json}");
        let back: ToolCall = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tc);
    }

    #[test]
    fn tool_call_deserializes_without_type_field() {
        let json = r#"{"id":"x","function":{"name":"f","arguments":"{}"}}"#;
        let tc: ToolCall = serde_json::from_str(json).unwrap();
        assert_eq!(tc.call_type, "function");
    }

    // ── Response helpers ──────────────────────────────────────────────────────

    #[test]
    fn chat_response_text_has_one_choice() {
        let r = ChatResponse::text("done");
        assert_eq!(r.message().unwrap().content, "done");
        assert!(r.message().unwrap().tool_calls.is_empty());
    }

    #[test]
    fn chat_response_with_usage_attaches_usage() {
        let r = ChatResponse::text("x").with_usage(Usage {
            prompt_tokens: 10,
            completion_tokens: 2,
            total_tokens: 12,
            estimated_cost: 0.001,
            cached_tokens: 4,
        });
        assert_eq!(r.usage.total_tokens, 12);
        assert_eq!(r.usage.cached_tokens, 4);
    }

    #[test]
    fn empty_response_has_no_message() {
        let r = ChatResponse::default();
        assert!(r.message().is_none());
    }
}
