// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;

use crate::{ChatRequest, ChatResponse};

/// Callback through which a streaming client emits text chunks as they
/// arrive.  Installed at client construction; the conversation driver never
/// sees partial output — it always receives the aggregated final response.
pub type StreamSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Contract between the conversation driver and a concrete LLM backend.
///
/// Implementations own the wire protocol, credential handling, and the
/// retry/backoff policy for transient transport errors.  An error returned
/// here is treated as unrecoverable by the driver: it ends the turn and
/// surfaces the error to the caller.
///
/// When streaming is requested (`req.stream`) a client that supports it
/// pushes chunks through its [`StreamSink`] and still returns the same
/// final response a non-streaming call would produce.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name for status display ("openai", "anthropic", "mock").
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send the message list (plus tool schemas and reasoning hint) and
    /// return the aggregated response with usage accounting.
    async fn send_chat_request(&self, req: ChatRequest) -> anyhow::Result<ChatResponse>;
}
