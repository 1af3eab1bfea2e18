// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    ChatRequest, ChatResponse, Choice, LlmClient, Message, ResponseMessage, Role, StreamSink,
    ToolCall, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Transient failures are retried this many times with exponential backoff.
/// The conversation driver never retries; backoff lives here by contract.
const MAX_ATTEMPTS: u32 = 3;

/// Client for OpenAI-compatible chat-completions endpoints (OpenAI itself,
/// LiteLLM, llama.cpp server, Ollama's compat mode).
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    /// Text chunks are pushed through this when a request asks to stream.
    /// The returned response is identical with or without a sink installed.
    stream_sink: Option<StreamSink>,
}

impl OpenAiClient {
    pub fn new(model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            api_key,
            temperature: None,
            max_tokens: None,
            stream_sink: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_stream_sink(mut self, sink: StreamSink) -> Self {
        self.stream_sink = Some(sink);
        self
    }

    fn wire_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                let mut obj = json!({ "role": role, "content": m.content });
                if !m.tool_calls.is_empty() {
                    obj["tool_calls"] = json!(m.tool_calls);
                }
                if let Some(id) = &m.tool_call_id {
                    obj["tool_call_id"] = json!(id);
                }
                obj
            })
            .collect()
    }

    fn body(&self, req: &ChatRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": Self::wire_messages(&req.messages),
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(
                req.tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(hint) = &req.reasoning_hint {
            body["reasoning_effort"] = json!(hint);
        }
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = self.max_tokens {
            body["max_tokens"] = json!(m);
        }
        body
    }

    fn parse_response(value: &Value) -> ChatResponse {
        let choices = value["choices"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|c| {
                        let msg = &c["message"];
                        let tool_calls: Vec<ToolCall> = msg["tool_calls"]
                            .as_array()
                            .map(|calls| {
                                calls
                                    .iter()
                                    .filter_map(|tc| {
                                        serde_json::from_value::<ToolCall>(tc.clone()).ok()
                                    })
                                    .collect()
                            })
                            .unwrap_or_default();
                        Choice {
                            message: ResponseMessage {
                                content: msg["content"].as_str().unwrap_or("").to_string(),
                                reasoning_content: msg["reasoning_content"]
                                    .as_str()
                                    .map(str::to_string),
                                tool_calls,
                            },
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let usage_value = &value["usage"];
        let usage = Usage {
            prompt_tokens: usage_value["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: usage_value["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: usage_value["total_tokens"].as_u64().unwrap_or(0),
            estimated_cost: usage_value["estimated_cost"].as_f64().unwrap_or(0.0),
            cached_tokens: usage_value["prompt_tokens_details"]["cached_tokens"]
                .as_u64()
                .unwrap_or(0),
        };
        ChatResponse { choices, usage }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn send_chat_request(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = self.body(&req);
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let mut request = self.http.post(&url).json(&body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let value: Value =
                            resp.json().await.context("decoding chat response")?;
                        debug!(model = %self.model, "chat completion ok");
                        let parsed = Self::parse_response(&value);
                        if req.stream {
                            if let (Some(sink), Some(msg)) =
                                (&self.stream_sink, parsed.message())
                            {
                                if !msg.content.is_empty() {
                                    sink(&msg.content);
                                }
                            }
                        }
                        return Ok(parsed);
                    }
                    let text = resp.text().await.unwrap_or_default();
                    // 429 and 5xx are retryable; anything else is a caller
                    // error and fails immediately.
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(attempt, %status, "retryable API error");
                        last_err = Some(anyhow::anyhow!("API error {status}: {text}"));
                    } else {
                        anyhow::bail!("API error {status}: {text}");
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "transport error");
                    last_err = Some(e.into());
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(500 * 2u64.pow(attempt - 1))).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("chat request failed")))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
