// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod client;
mod mock;
mod openai;
mod types;

pub use client::{LlmClient, StreamSink};
pub use mock::{EchoClient, ScriptedClient};
pub use openai::OpenAiClient;
pub use types::{
    ChatRequest, ChatResponse, Choice, FunctionCall, Message, ResponseMessage, Role, ToolCall,
    ToolSchema, Usage,
};
