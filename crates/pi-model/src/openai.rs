// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI Chat-Completions adapter.
//!
//! One adapter serves every completions-compatible endpoint; the gateway
//! table below supplies default base URLs and key environment variables per
//! provider id.  Wire-format quirks come from the model's compat matrix.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    catalog::{MaxTokensField, Model},
    provider::{Provider, ProviderContext, StreamOptions},
    sse::sse_data_lines,
    stream::{AssistantEventStream, EventSink},
    types::{ContentBlock, Message, StopReason, TokenUsage, UserContent},
};

/// Default endpoint and credential env var for a completions-compatible
/// provider.
pub struct GatewayMeta {
    pub provider: &'static str,
    pub base_url: &'static str,
    pub key_env: &'static str,
}

/// Providers served through this adapter.
pub static GATEWAYS: &[GatewayMeta] = &[
    GatewayMeta {
        provider: "openai",
        base_url: "https://api.openai.com/v1",
        key_env: "OPENAI_API_KEY",
    },
    GatewayMeta {
        provider: "google",
        base_url: "https://generativelanguage.googleapis.com/v1beta/openai",
        key_env: "GEMINI_API_KEY",
    },
    GatewayMeta {
        provider: "groq",
        base_url: "https://api.groq.com/openai/v1",
        key_env: "GROQ_API_KEY",
    },
    GatewayMeta {
        provider: "cerebras",
        base_url: "https://api.cerebras.ai/v1",
        key_env: "CEREBRAS_API_KEY",
    },
    GatewayMeta {
        provider: "xai",
        base_url: "https://api.x.ai/v1",
        key_env: "XAI_API_KEY",
    },
    GatewayMeta {
        provider: "openrouter",
        base_url: "https://openrouter.ai/api/v1",
        key_env: "OPENROUTER_API_KEY",
    },
    GatewayMeta {
        provider: "mistral",
        base_url: "https://api.mistral.ai/v1",
        key_env: "MISTRAL_API_KEY",
    },
    GatewayMeta {
        provider: "zai",
        base_url: "https://api.z.ai/api/paas/v4",
        key_env: "ZAI_API_KEY",
    },
];

pub fn gateway_for(provider: &str) -> Option<&'static GatewayMeta> {
    GATEWAYS.iter().find(|g| g.provider == provider)
}

pub struct OpenAiCompletionsProvider {
    client: reqwest::Client,
}

impl OpenAiCompletionsProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for OpenAiCompletionsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for OpenAiCompletionsProvider {
    fn api(&self) -> &str {
        "openai-completions"
    }

    async fn stream(
        &self,
        model: &Model,
        context: ProviderContext,
        options: StreamOptions,
    ) -> anyhow::Result<AssistantEventStream> {
        let gateway = gateway_for(&model.provider);
        let key = match &options.api_key {
            Some(k) => k.clone(),
            None => {
                let env = gateway
                    .map(|g| g.key_env)
                    .ok_or_else(|| anyhow::anyhow!("unknown provider: {}", model.provider))?;
                std::env::var(env).map_err(|_| anyhow::anyhow!("{env} not set"))?
            }
        };
        let base_url = options
            .base_url
            .clone()
            .or_else(|| gateway.map(|g| g.base_url.to_string()))
            .ok_or_else(|| anyhow::anyhow!("no base URL for provider {}", model.provider))?;

        let body = build_request_body(model, &context, &options);
        let request = self
            .client
            .post(format!(
                "{}/chat/completions",
                base_url.trim_end_matches('/')
            ))
            .bearer_auth(key)
            .json(&body);

        let (sink, stream) = EventSink::channel(self.api(), &model.provider, &model.id);
        let provider = model.provider.clone();
        let cancel = options.cancel.clone();
        tokio::spawn(pump(request, sink, cancel, provider));
        Ok(stream)
    }
}

async fn pump(
    request: reqwest::RequestBuilder,
    mut sink: EventSink,
    cancel: CancellationToken,
    provider: String,
) {
    let resp = tokio::select! {
        biased;
        _ = cancel.cancelled() => { sink.aborted().await; return; }
        resp = request.send() => resp,
    };
    let resp = match resp {
        Ok(r) => r,
        Err(e) => {
            sink.error(format!("{provider} request failed: {e}")).await;
            return;
        }
    };
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        sink.error(format!("{provider} error {status}: {text}")).await;
        return;
    }

    let mut feed = Box::pin(sse_data_lines(resp));
    // Fragments keyed by the provider's parallel-tool-call index.  A start
    // event is forwarded when an index is first seen; later chunks for the
    // same index only carry argument fragments.
    let mut started: BTreeMap<u64, ()> = BTreeMap::new();
    let mut stop_reason: Option<StopReason> = None;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => { sink.aborted().await; return; }
            next = feed.next() => next,
        };
        let data = match next {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                sink.error(format!("{provider} stream error: {e}")).await;
                return;
            }
            None => break,
        };
        let Ok(v) = serde_json::from_str::<Value>(&data) else {
            continue;
        };
        if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
            let msg = err["message"].as_str().unwrap_or("unknown error");
            sink.error(format!("{provider} stream error: {msg}")).await;
            return;
        }

        if let Some(usage) = v.get("usage").filter(|u| u.is_object()) {
            sink.usage(parse_usage(usage)).await;
        }

        let choice = &v["choices"][0];
        if let Some(reason) = choice["finish_reason"].as_str() {
            stop_reason = Some(map_finish_reason(reason));
        }
        let delta = &choice["delta"];
        if let Some(text) = delta["content"].as_str() {
            sink.text_delta(text).await;
        }
        // Reasoning models surface thinking under `reasoning_content`
        // (DeepSeek convention) or `reasoning` (OpenRouter).
        for field in ["reasoning_content", "reasoning"] {
            if let Some(thinking) = delta[field].as_str() {
                sink.thinking_delta(thinking).await;
            }
        }
        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0);
                if started.insert(index, ()).is_none() {
                    let id = tc["id"].as_str().unwrap_or("");
                    let name = tc["function"]["name"].as_str().unwrap_or("");
                    if name.is_empty() {
                        warn!(index, "tool-call chunk opened without a name");
                    }
                    sink.tool_call_start(index as usize, id, name).await;
                }
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    if !args.is_empty() {
                        sink.tool_call_arg_delta(index as usize, args).await;
                    }
                }
            }
        }
    }

    // Completions streams have no per-call end marker; close every open
    // fragment at end of stream.
    for index in started.keys() {
        sink.tool_call_end(*index as usize).await;
    }
    sink.done(stop_reason.unwrap_or(StopReason::Stop)).await;
}

fn parse_usage(usage: &Value) -> TokenUsage {
    TokenUsage {
        input: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        cache_read: usage["prompt_tokens_details"]["cached_tokens"]
            .as_u64()
            .unwrap_or(0) as u32,
        cache_write: 0,
    }
}

fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "length" => StopReason::MaxTokens,
        _ => StopReason::Stop,
    }
}

// ─── Request building ─────────────────────────────────────────────────────────

fn build_request_body(model: &Model, context: &ProviderContext, options: &StreamOptions) -> Value {
    let mut body = json!({
        "model": model.id,
        "messages": build_wire_messages(model, context),
        "stream": true,
        "stream_options": { "include_usage": true },
    });

    let max_tokens = options.max_tokens.unwrap_or(model.max_tokens);
    match model.compat.max_tokens_field {
        MaxTokensField::MaxTokens => body["max_tokens"] = json!(max_tokens),
        MaxTokensField::MaxCompletionTokens => body["max_completion_tokens"] = json!(max_tokens),
    }

    if !context.tools.is_empty() {
        let tools: Vec<Value> = context
            .tools
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
            .collect();
        body["tools"] = json!(tools);
    }

    if model.compat.supports_reasoning_effort {
        if let Some(effort) = options.thinking_level.effort() {
            body["reasoning_effort"] = json!(effort);
        }
    }

    // Stable cache key for endpoints that key their prompt cache by session.
    if let Some(session_id) = &options.session_id {
        if matches!(model.provider.as_str(), "openai" | "openrouter") {
            body["prompt_cache_key"] = json!(session_id);
        }
    }

    body
}

fn build_wire_messages(model: &Model, context: &ProviderContext) -> Vec<Value> {
    let compat = &model.compat;
    let mut out: Vec<Value> = Vec::new();

    if let Some(system) = &context.system_prompt {
        let role = if compat.supports_developer_role {
            "developer"
        } else {
            "system"
        };
        out.push(json!({ "role": role, "content": system }));
    }

    for m in &context.messages {
        match m {
            Message::User { content, .. } => match content {
                UserContent::Text(t) => out.push(json!({ "role": "user", "content": t })),
                UserContent::Blocks(blocks) => {
                    let parts: Vec<Value> = blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => {
                                Some(json!({ "type": "text", "text": text }))
                            }
                            ContentBlock::Image { data, mime } => Some(json!({
                                "type": "image_url",
                                "image_url": { "url": format!("data:{mime};base64,{data}") }
                            })),
                            _ => None,
                        })
                        .collect();
                    out.push(json!({ "role": "user", "content": parts }));
                }
            },
            Message::Assistant(a) => {
                let mut text = String::new();
                let mut tool_calls: Vec<Value> = Vec::new();
                for b in &a.content {
                    match b {
                        ContentBlock::Text { text: t } => text.push_str(t),
                        // Same-model replay of reasoning content; completions
                        // has no thinking field, so it rides as text.
                        ContentBlock::Thinking { thinking, .. } => text.push_str(thinking),
                        ContentBlock::ToolCall {
                            id,
                            name,
                            arguments,
                        } => tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": Value::Object(arguments.clone()).to_string(),
                            }
                        })),
                        _ => {}
                    }
                }
                let mut msg = json!({ "role": "assistant" });
                msg["content"] = if text.is_empty() {
                    Value::Null
                } else {
                    json!(text)
                };
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = json!(tool_calls);
                }
                out.push(msg);
            }
            Message::ToolResult(r) => {
                let mut msg = json!({
                    "role": "tool",
                    "tool_call_id": r.tool_call_id,
                    "content": r.text(),
                });
                if compat.requires_tool_result_name {
                    msg["name"] = json!(r.tool_name);
                }
                out.push(msg);
            }
            Message::Custom { role, .. } => {
                warn!(custom_role = %role, "custom message reached the completions adapter; skipping");
            }
        }
    }

    if compat.requires_assistant_after_tool_result {
        insert_assistant_separators(&mut out);
    }

    out
}

/// Some endpoints reject a `user` turn directly after a `tool` turn; insert
/// an empty assistant turn between them.
fn insert_assistant_separators(messages: &mut Vec<Value>) {
    let mut i = 1;
    while i < messages.len() {
        if messages[i]["role"] == "user" && messages[i - 1]["role"] == "tool" {
            messages.insert(i, json!({ "role": "assistant", "content": "" }));
            i += 1;
        }
        i += 1;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
