// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{ChatRequest, ChatResponse, LlmClient, Role, ToolCall, Usage};

/// Deterministic mock client for tests.  Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct EchoClient;

#[async_trait]
impl LlmClient for EchoClient {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn send_chat_request(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("[no input]");
        Ok(ChatResponse::text(format!("MOCK: {reply}")).with_usage(Usage {
            prompt_tokens: 10,
            completion_tokens: 10,
            total_tokens: 20,
            estimated_cost: 0.0,
            cached_tokens: 0,
        }))
    }
}

/// A pre-scripted mock client.  Each `send_chat_request` call pops the next
/// response from the front of the queue, so tests can specify exact
/// sequences — including tool calls and usage — without network access.
pub struct ScriptedClient {
    scripts: Arc<Mutex<Vec<ChatResponse>>>,
    /// The last `ChatRequest` seen by this client.  Written on each call so
    /// tests can inspect what the driver actually sent.
    pub last_request: Arc<Mutex<Option<ChatRequest>>>,
    /// Every request seen, in order.
    pub requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl ScriptedClient {
    /// Build a client from the ordered list of responses to replay.
    pub fn new(scripts: Vec<ChatResponse>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: a client that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![ChatResponse::text(reply).with_usage(default_usage())])
    }

    /// Convenience: a tool call on the first round, text on the second.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            ChatResponse::with_tool_calls(
                "",
                vec![ToolCall::new(tool_id, tool_name, args_json)],
            )
            .with_usage(default_usage()),
            ChatResponse::text(final_text).with_usage(default_usage()),
        ])
    }
}

fn default_usage() -> Usage {
    Usage {
        prompt_tokens: 5,
        completion_tokens: 5,
        total_tokens: 10,
        estimated_cost: 0.0001,
        cached_tokens: 0,
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn send_chat_request(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        *self.last_request.lock().unwrap() = Some(req.clone());
        self.requests.lock().unwrap().push(req);
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            // Default fallback when all scripts are consumed
            Ok(ChatResponse::text("[no more scripts]"))
        } else {
            Ok(scripts.remove(0))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    fn req(text: &str) -> ChatRequest {
        ChatRequest {
            messages: vec![Message::user(text)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn echo_replies_with_last_user_message() {
        let c = EchoClient;
        let resp = c.send_chat_request(req("hi")).await.unwrap();
        assert!(resp.message().unwrap().content.contains("MOCK: hi"));
    }

    #[tokio::test]
    async fn scripted_replays_in_order() {
        let c = ScriptedClient::new(vec![ChatResponse::text("one"), ChatResponse::text("two")]);
        let a = c.send_chat_request(req("x")).await.unwrap();
        let b = c.send_chat_request(req("y")).await.unwrap();
        assert_eq!(a.message().unwrap().content, "one");
        assert_eq!(b.message().unwrap().content, "two");
    }

    #[tokio::test]
    async fn scripted_records_last_request() {
        let c = ScriptedClient::always_text("ok");
        c.send_chat_request(req("inspect me")).await.unwrap();
        let last = c.last_request.lock().unwrap();
        assert_eq!(last.as_ref().unwrap().messages[0].content, "inspect me");
    }

    #[tokio::test]
    async fn scripted_tool_then_text_sequence() {
        let c = ScriptedClient::tool_then_text("c1", "read_file", r#"{"path":"a"}"#, "done");
        let first = c.send_chat_request(req("go")).await.unwrap();
        assert_eq!(first.message().unwrap().tool_calls[0].function.name, "read_file");
        let second = c.send_chat_request(req("go")).await.unwrap();
        assert_eq!(second.message().unwrap().content, "done");
    }

    #[tokio::test]
    async fn scripted_fallback_when_exhausted() {
        let c = ScriptedClient::new(vec![]);
        let resp = c.send_chat_request(req("x")).await.unwrap();
        assert!(resp.message().unwrap().content.contains("no more scripts"));
    }
}
