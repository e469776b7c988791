// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    catalog::Model,
    provider::{Provider, ProviderContext, StreamOptions},
    stream::{AssistantEventStream, EventSink},
    types::{Message, StopReason, TokenUsage},
};

/// Deterministic mock provider: echoes the last user message back as the
/// assistant response.  Registered under the `mock` api for offline runs.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl Provider for MockProvider {
    fn api(&self) -> &str {
        "mock"
    }

    async fn stream(
        &self,
        model: &Model,
        context: ProviderContext,
        _options: StreamOptions,
    ) -> anyhow::Result<AssistantEventStream> {
        let reply = context
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::User { content, .. } => content.as_text().map(str::to_string),
                _ => None,
            })
            .unwrap_or_else(|| "[no input]".into());

        let (mut sink, stream) = EventSink::channel(self.api(), &model.provider, &model.id);
        tokio::spawn(async move {
            sink.text_delta(format!("MOCK: {reply}")).await;
            sink.usage(TokenUsage {
                input: 10,
                output: 10,
                cache_read: 0,
                cache_write: 0,
            })
            .await;
            sink.done(StopReason::Stop).await;
        });
        Ok(stream)
    }
}

/// One scripted turn of a [`ScriptedProvider`].
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Stream `text` as two deltas, then stop.
    Text(String),
    /// Stream a thinking block, then the text.
    ThinkingThenText { thinking: String, text: String },
    /// Emit one tool call with the given id, name and JSON arguments.
    ToolCall {
        id: String,
        name: String,
        args: Value,
    },
    /// Emit several tool calls in one assistant message.
    ToolCalls(Vec<(String, String, Value)>),
    /// Finish with a transport-style error.
    Error(String),
    /// Stop reporting the output-token limit was hit.
    MaxTokens(String),
    /// Never produce events until cancelled (for abort tests).
    Hang,
}

/// A pre-scripted provider.  Each `stream` call pops the next turn from the
/// front of the queue, so tests can specify exact event sequences —
/// including tool calls and failures — without network access.
pub struct ScriptedProvider {
    turns: Arc<Mutex<Vec<ScriptedTurn>>>,
    /// The last context seen, for request-shape assertions.
    pub last_context: Arc<Mutex<Option<ProviderContext>>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Arc::new(Mutex::new(turns)),
            last_context: Arc::new(Mutex::new(None)),
        }
    }

    /// Provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![ScriptedTurn::Text(reply.into())])
    }

    /// Provider that returns one tool call, then a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            ScriptedTurn::ToolCall {
                id: tool_id.into(),
                name: tool_name.into(),
                args,
            },
            ScriptedTurn::Text(final_text.into()),
        ])
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn api(&self) -> &str {
        "mock"
    }

    async fn stream(
        &self,
        model: &Model,
        context: ProviderContext,
        options: StreamOptions,
    ) -> anyhow::Result<AssistantEventStream> {
        *self.last_context.lock().unwrap() = Some(context);
        let turn = {
            let mut turns = self.turns.lock().unwrap();
            if turns.is_empty() {
                ScriptedTurn::Text("[no more scripts]".into())
            } else {
                turns.remove(0)
            }
        };

        let (mut sink, stream) = EventSink::channel(self.api(), &model.provider, &model.id);
        let cancel = options.cancel.clone();
        tokio::spawn(async move {
            match turn {
                ScriptedTurn::Text(text) => {
                    let mid = text.len() / 2;
                    sink.text_delta(text[..mid].to_string()).await;
                    sink.text_delta(text[mid..].to_string()).await;
                    sink.usage(TokenUsage {
                        input: 5,
                        output: 5,
                        cache_read: 0,
                        cache_write: 0,
                    })
                    .await;
                    sink.done(StopReason::Stop).await;
                }
                ScriptedTurn::ThinkingThenText { thinking, text } => {
                    sink.thinking_delta(thinking).await;
                    sink.thinking_signature("mock-signature");
                    sink.text_delta(text).await;
                    sink.done(StopReason::Stop).await;
                }
                ScriptedTurn::ToolCall { id, name, args } => {
                    sink.tool_call_start(0, &id, &name).await;
                    sink.tool_call_arg_delta(0, &args.to_string()).await;
                    sink.tool_call_end(0).await;
                    sink.done(StopReason::ToolUse).await;
                }
                ScriptedTurn::ToolCalls(calls) => {
                    for (index, (id, name, args)) in calls.into_iter().enumerate() {
                        sink.tool_call_start(index, &id, &name).await;
                        sink.tool_call_arg_delta(index, &args.to_string()).await;
                        sink.tool_call_end(index).await;
                    }
                    sink.done(StopReason::ToolUse).await;
                }
                ScriptedTurn::Error(message) => {
                    sink.error(message).await;
                }
                ScriptedTurn::MaxTokens(text) => {
                    sink.text_delta(text).await;
                    sink.done(StopReason::MaxTokens).await;
                }
                ScriptedTurn::Hang => {
                    cancel.cancelled().await;
                    sink.aborted().await;
                }
            }
        });
        Ok(stream)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
