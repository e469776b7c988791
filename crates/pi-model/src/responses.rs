// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI Responses adapter.
//!
//! The Responses API is item-oriented rather than message-oriented: tool
//! calls and their outputs are top-level input items, and streamed events
//! are typed by name.  This endpoint supports prompt-cache retention keyed
//! by session (`prompt_cache_key`).

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    cache_retention_long,
    catalog::Model,
    provider::{Provider, ProviderContext, StreamOptions},
    sse::sse_data_lines,
    stream::{AssistantEventStream, EventSink},
    types::{ContentBlock, Message, StopReason, TokenUsage, UserContent},
};

const OFFICIAL_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiResponsesProvider {
    client: reqwest::Client,
}

impl OpenAiResponsesProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for OpenAiResponsesProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for OpenAiResponsesProvider {
    fn api(&self) -> &str {
        "openai-responses"
    }

    async fn stream(
        &self,
        model: &Model,
        context: ProviderContext,
        options: StreamOptions,
    ) -> anyhow::Result<AssistantEventStream> {
        let key = match &options.api_key {
            Some(k) => k.clone(),
            None => std::env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?,
        };
        let base_url = options
            .base_url
            .clone()
            .unwrap_or_else(|| OFFICIAL_BASE_URL.into());
        let official = base_url.trim_end_matches('/') == OFFICIAL_BASE_URL;
        let body = build_request_body(model, &context, &options, official && cache_retention_long());

        let request = self
            .client
            .post(format!("{}/responses", base_url.trim_end_matches('/')))
            .bearer_auth(key)
            .json(&body);

        let (sink, stream) = EventSink::channel(self.api(), &model.provider, &model.id);
        let cancel = options.cancel.clone();
        tokio::spawn(pump(request, sink, cancel));
        Ok(stream)
    }
}

async fn pump(request: reqwest::RequestBuilder, mut sink: EventSink, cancel: CancellationToken) {
    let resp = tokio::select! {
        biased;
        _ = cancel.cancelled() => { sink.aborted().await; return; }
        resp = request.send() => resp,
    };
    let resp = match resp {
        Ok(r) => r,
        Err(e) => {
            sink.error(format!("OpenAI request failed: {e}")).await;
            return;
        }
    };
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        sink.error(format!("OpenAI error {status}: {text}")).await;
        return;
    }

    let mut feed = Box::pin(sse_data_lines(resp));
    // output_index → is this item a function call
    let mut function_items: BTreeMap<usize, ()> = BTreeMap::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => { sink.aborted().await; return; }
            next = feed.next() => next,
        };
        let data = match next {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                sink.error(format!("OpenAI stream error: {e}")).await;
                return;
            }
            None => {
                sink.done(StopReason::Stop).await;
                return;
            }
        };
        let Ok(v) = serde_json::from_str::<Value>(&data) else {
            continue;
        };
        match v["type"].as_str().unwrap_or("") {
            "response.output_text.delta" => {
                if let Some(delta) = v["delta"].as_str() {
                    sink.text_delta(delta).await;
                }
            }
            "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => {
                if let Some(delta) = v["delta"].as_str() {
                    sink.thinking_delta(delta).await;
                }
            }
            "response.output_item.added" => {
                let item = &v["item"];
                if item["type"].as_str() == Some("function_call") {
                    let index = v["output_index"].as_u64().unwrap_or(0) as usize;
                    function_items.insert(index, ());
                    sink.tool_call_start(
                        index,
                        item["call_id"].as_str().unwrap_or(""),
                        item["name"].as_str().unwrap_or(""),
                    )
                    .await;
                }
            }
            "response.function_call_arguments.delta" => {
                let index = v["output_index"].as_u64().unwrap_or(0) as usize;
                if let Some(delta) = v["delta"].as_str() {
                    sink.tool_call_arg_delta(index, delta).await;
                }
            }
            "response.output_item.done" => {
                let index = v["output_index"].as_u64().unwrap_or(0) as usize;
                if function_items.remove(&index).is_some() {
                    sink.tool_call_end(index).await;
                }
            }
            "response.completed" | "response.incomplete" => {
                let response = &v["response"];
                if let Some(usage) = response.get("usage").filter(|u| u.is_object()) {
                    sink.usage(TokenUsage {
                        input: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                        output: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                        cache_read: usage["input_tokens_details"]["cached_tokens"]
                            .as_u64()
                            .unwrap_or(0) as u32,
                        cache_write: 0,
                    })
                    .await;
                }
                let reason = final_stop_reason(response, !function_items.is_empty());
                for index in function_items.keys() {
                    sink.tool_call_end(*index).await;
                }
                sink.done(reason).await;
                return;
            }
            "response.failed" => {
                let msg = v["response"]["error"]["message"]
                    .as_str()
                    .unwrap_or("response failed");
                sink.error(format!("OpenAI stream error: {msg}")).await;
                return;
            }
            "error" => {
                let msg = v["message"].as_str().unwrap_or("unknown error");
                sink.error(format!("OpenAI stream error: {msg}")).await;
                return;
            }
            _ => {}
        }
    }
}

fn final_stop_reason(response: &Value, had_open_calls: bool) -> StopReason {
    if response["status"].as_str() == Some("incomplete")
        && response["incomplete_details"]["reason"].as_str() == Some("max_output_tokens")
    {
        return StopReason::MaxTokens;
    }
    let emitted_call = had_open_calls
        || response["output"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .any(|i| i["type"].as_str() == Some("function_call"))
            })
            .unwrap_or(false);
    if emitted_call {
        StopReason::ToolUse
    } else {
        StopReason::Stop
    }
}

// ─── Request building ─────────────────────────────────────────────────────────

fn build_request_body(
    model: &Model,
    context: &ProviderContext,
    options: &StreamOptions,
    retention: bool,
) -> Value {
    let mut body = json!({
        "model": model.id,
        "input": build_input_items(&context.messages),
        "stream": true,
        "max_output_tokens": options.max_tokens.unwrap_or(model.max_tokens),
    });

    if let Some(system) = &context.system_prompt {
        body["instructions"] = json!(system);
    }
    if !model.compat.supports_store {
        body["store"] = json!(false);
    }
    if !context.tools.is_empty() {
        let tools: Vec<Value> = context
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    if model.compat.supports_reasoning_effort {
        if let Some(effort) = options.thinking_level.effort() {
            body["reasoning"] = json!({ "effort": effort });
        }
    }
    // Session-keyed prompt caching: the session id doubles as the cache key
    // so resumed sessions keep their cache hits.
    if let Some(session_id) = &options.session_id {
        body["prompt_cache_key"] = json!(session_id);
        if retention {
            body["prompt_cache_retention"] = json!("24h");
        }
    }

    body
}

fn build_input_items(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for m in messages {
        match m {
            Message::User { content, .. } => {
                let parts: Vec<Value> = match content {
                    UserContent::Text(t) => vec![json!({ "type": "input_text", "text": t })],
                    UserContent::Blocks(blocks) => blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => {
                                Some(json!({ "type": "input_text", "text": text }))
                            }
                            ContentBlock::Image { data, mime } => Some(json!({
                                "type": "input_image",
                                "image_url": format!("data:{mime};base64,{data}"),
                            })),
                            _ => None,
                        })
                        .collect(),
                };
                out.push(json!({ "role": "user", "content": parts }));
            }
            Message::Assistant(a) => {
                let text = a.text();
                if !text.is_empty() {
                    out.push(json!({
                        "role": "assistant",
                        "content": [{ "type": "output_text", "text": text }],
                    }));
                }
                for (id, name, args) in a.tool_calls() {
                    out.push(json!({
                        "type": "function_call",
                        "call_id": id,
                        "name": name,
                        "arguments": Value::Object(args.clone()).to_string(),
                    }));
                }
            }
            Message::ToolResult(r) => {
                out.push(json!({
                    "type": "function_call_output",
                    "call_id": r.tool_call_id,
                    "output": r.text(),
                }));
            }
            Message::Custom { role, .. } => {
                warn!(custom_role = %role, "custom message reached the responses adapter; skipping");
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
