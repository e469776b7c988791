// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashSet;
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

const OFFICIAL_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Adapter for the Anthropic Messages API (SSE streaming).
pub struct AnthropicProvider {
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

enum Auth {
    ApiKey(String),
    OauthToken(String),
}

fn resolve_auth(options: &StreamOptions) -> anyhow::Result<Auth> {
    if let Some(key) = &options.api_key {
        return Ok(Auth::ApiKey(key.clone()));
    }
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        return Ok(Auth::ApiKey(key));
    }
    if let Ok(token) = std::env::var("ANTHROPIC_OAUTH_TOKEN") {
        return Ok(Auth::OauthToken(token));
    }
    anyhow::bail!("ANTHROPIC_API_KEY / ANTHROPIC_OAUTH_TOKEN not set")
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn api(&self) -> &str {
        "anthropic-messages"
    }

    async fn stream(
        &self,
        model: &Model,
        context: ProviderContext,
        options: StreamOptions,
    ) -> anyhow::Result<AssistantEventStream> {
        let auth = resolve_auth(&options)?;
        let base_url = options
            .base_url
            .clone()
            .unwrap_or_else(|| OFFICIAL_BASE_URL.into());
        // Retention hints must never reach proxies or compatible gateways.
        let official = base_url.trim_end_matches('/') == OFFICIAL_BASE_URL;
        let body = build_request_body(model, &context, &options, official && cache_retention_long());

        let mut request = self
            .client
            .post(format!("{}/v1/messages", base_url.trim_end_matches('/')))
            .header("anthropic-version", API_VERSION);
        request = match &auth {
            Auth::ApiKey(key) => request.header("x-api-key", key.clone()),
            Auth::OauthToken(token) => request.bearer_auth(token.clone()),
        };

        let (sink, stream) = EventSink::channel(self.api(), &model.provider, &model.id);
        let cancel = options.cancel.clone();
        tokio::spawn(pump(request.json(&body), sink, cancel));
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
            sink.error(format!("Anthropic request failed: {e}")).await;
            return;
        }
    };
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        sink.error(format!("Anthropic error {status}: {text}")).await;
        return;
    }

    let mut feed = Box::pin(sse_data_lines(resp));
    let mut tool_indices: HashSet<usize> = HashSet::new();
    let mut stop_reason = StopReason::Stop;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => { sink.aborted().await; return; }
            next = feed.next() => next,
        };
        let data = match next {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                sink.error(format!("Anthropic stream error: {e}")).await;
                return;
            }
            None => {
                // Server closed without message_stop; treat what we have as
                // a complete message.
                sink.done(stop_reason).await;
                return;
            }
        };
        let Ok(v) = serde_json::from_str::<Value>(&data) else {
            continue;
        };
        for parsed in parse_event(&v) {
            match parsed {
                Parsed::Text(t) => sink.text_delta(t).await,
                Parsed::Thinking(t) => sink.thinking_delta(t).await,
                Parsed::Signature(s) => sink.thinking_signature(s),
                Parsed::RedactedThinking(d) => sink.redacted_thinking(d),
                Parsed::ToolStart { index, id, name } => {
                    tool_indices.insert(index);
                    sink.tool_call_start(index, &id, &name).await;
                }
                Parsed::ToolArg { index, json } => {
                    sink.tool_call_arg_delta(index, &json).await;
                }
                Parsed::BlockStop { index } => {
                    if tool_indices.remove(&index) {
                        sink.tool_call_end(index).await;
                    }
                }
                Parsed::Usage(u) => sink.usage(u).await,
                Parsed::Stop(reason) => stop_reason = reason,
                Parsed::Done => {
                    sink.done(stop_reason).await;
                    return;
                }
                Parsed::Error(e) => {
                    sink.error(e).await;
                    return;
                }
            }
        }
    }
}

// ─── SSE event parsing ────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Parsed {
    Text(String),
    Thinking(String),
    Signature(String),
    RedactedThinking(String),
    ToolStart { index: usize, id: String, name: String },
    ToolArg { index: usize, json: String },
    BlockStop { index: usize },
    Usage(TokenUsage),
    Stop(StopReason),
    Done,
    Error(String),
}

fn parse_event(v: &Value) -> Vec<Parsed> {
    match v["type"].as_str().unwrap_or("") {
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as usize;
            let block = &v["content_block"];
            match block["type"].as_str().unwrap_or("") {
                "tool_use" => vec![Parsed::ToolStart {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                }],
                "redacted_thinking" => vec![Parsed::RedactedThinking(
                    block["data"].as_str().unwrap_or("").to_string(),
                )],
                _ => vec![],
            }
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as usize;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("");
                    if text.is_empty() {
                        vec![]
                    } else {
                        vec![Parsed::Text(text.to_string())]
                    }
                }
                "thinking_delta" => {
                    let thinking = delta["thinking"].as_str().unwrap_or("");
                    if thinking.is_empty() {
                        vec![]
                    } else {
                        vec![Parsed::Thinking(thinking.to_string())]
                    }
                }
                // The signature blob authenticates the thinking block; it is
                // carried on the block, never rendered as text.
                "signature_delta" => vec![Parsed::Signature(
                    delta["signature"].as_str().unwrap_or("").to_string(),
                )],
                "input_json_delta" => vec![Parsed::ToolArg {
                    index,
                    json: delta["partial_json"].as_str().unwrap_or("").to_string(),
                }],
                _ => vec![],
            }
        }
        "content_block_stop" => {
            let index = v["index"].as_u64().unwrap_or(0) as usize;
            vec![Parsed::BlockStop { index }]
        }
        "message_start" => {
            let usage = &v["message"]["usage"];
            if usage.is_object() {
                vec![Parsed::Usage(TokenUsage {
                    input: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    output: 0,
                    cache_read: usage["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32,
                    cache_write: usage["cache_creation_input_tokens"].as_u64().unwrap_or(0) as u32,
                })]
            } else {
                vec![]
            }
        }
        "message_delta" => {
            let mut out = Vec::new();
            if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                out.push(Parsed::Stop(map_stop_reason(reason)));
            }
            if let Some(output) = v["usage"]["output_tokens"].as_u64() {
                out.push(Parsed::Usage(TokenUsage {
                    input: 0,
                    output: output as u32,
                    cache_read: 0,
                    cache_write: 0,
                }));
            }
            out
        }
        "message_stop" => vec![Parsed::Done],
        "error" => vec![Parsed::Error(format!(
            "Anthropic stream error: {}",
            v["error"]["message"].as_str().unwrap_or("unknown")
        ))],
        // ping and future event types
        _ => vec![],
    }
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        // end_turn, stop_sequence, refusal
        _ => StopReason::Stop,
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
        "messages": build_wire_messages(&context.messages),
        "max_tokens": options.max_tokens.unwrap_or(model.max_tokens),
        "stream": true,
    });

    if let Some(system) = &context.system_prompt {
        if retention {
            // Extended-TTL cache hint on the system block, official endpoint
            // only.
            body["system"] = json!([{
                "type": "text",
                "text": system,
                "cache_control": { "type": "ephemeral", "ttl": "1h" },
            }]);
        } else {
            body["system"] = json!(system);
        }
    }

    if !context.tools.is_empty() {
        let tools: Vec<Value> = context
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    if model.reasoning {
        if let Some(budget) = options.thinking_level.budget_tokens() {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        }
    }

    body
}

fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for m in messages {
        match m {
            Message::User { content, .. } => match content {
                UserContent::Text(t) => out.push(json!({ "role": "user", "content": t })),
                UserContent::Blocks(blocks) => {
                    out.push(json!({ "role": "user", "content": user_blocks(blocks) }))
                }
            },
            Message::Assistant(a) => {
                let content: Vec<Value> =
                    a.content.iter().filter_map(assistant_block).collect();
                if !content.is_empty() {
                    out.push(json!({ "role": "assistant", "content": content }));
                }
            }
            Message::ToolResult(r) => {
                let content = tool_result_content(&r.content);
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": r.tool_call_id,
                        "content": content,
                        "is_error": r.is_error,
                    }]
                }));
            }
            Message::Custom { role, .. } => {
                // The transformer converts or drops custom messages before
                // the adapter sees them.
                warn!(custom_role = %role, "custom message reached the Anthropic adapter; skipping");
            }
        }
    }
    out
}

fn user_blocks(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
            ContentBlock::Image { data, mime } => Some(json!({
                "type": "image",
                "source": { "type": "base64", "media_type": mime, "data": data }
            })),
            ContentBlock::Document { data, mime } => Some(json!({
                "type": "document",
                "source": { "type": "base64", "media_type": mime, "data": data }
            })),
            _ => None,
        })
        .collect()
}

fn assistant_block(b: &ContentBlock) -> Option<Value> {
    match b {
        ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
        ContentBlock::Thinking {
            thinking,
            signature,
        } => Some(json!({
            "type": "thinking",
            "thinking": thinking,
            "signature": signature.clone().unwrap_or_default(),
        })),
        ContentBlock::RedactedThinking { data } => {
            Some(json!({ "type": "redacted_thinking", "data": data }))
        }
        ContentBlock::ToolCall {
            id,
            name,
            arguments,
        } => Some(json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": arguments,
        })),
        _ => None,
    }
}

fn tool_result_content(blocks: &[ContentBlock]) -> Value {
    let has_image = blocks
        .iter()
        .any(|b| matches!(b, ContentBlock::Image { .. }));
    if !has_image {
        let text: String = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        return json!(text);
    }
    json!(user_blocks(blocks))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::lookup;
    use crate::provider::ThinkingLevel;
    use crate::types::AssistantMessage;
    use chrono::Utc;

    fn opus() -> Model {
        lookup("anthropic", "claude-opus-4-6").unwrap()
    }

    // ── parse_event ───────────────────────────────────────────────────────────

    #[test]
    fn message_start_yields_input_and_cache_usage() {
        let v = json!({
            "type": "message_start",
            "message": { "usage": {
                "input_tokens": 100,
                "cache_read_input_tokens": 80,
                "cache_creation_input_tokens": 20
            }}
        });
        assert_eq!(
            parse_event(&v),
            vec![Parsed::Usage(TokenUsage {
                input: 100,
                output: 0,
                cache_read: 80,
                cache_write: 20
            })]
        );
    }

    #[test]
    fn content_block_start_tool_use_carries_index_id_name() {
        let v = json!({
            "type": "content_block_start",
            "index": 2,
            "content_block": { "type": "tool_use", "id": "toolu_01", "name": "bash" }
        });
        assert_eq!(
            parse_event(&v),
            vec![Parsed::ToolStart {
                index: 2,
                id: "toolu_01".into(),
                name: "bash".into()
            }]
        );
    }

    #[test]
    fn content_block_start_text_is_silent() {
        let v = json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": { "type": "text", "text": "" }
        });
        assert!(parse_event(&v).is_empty());
    }

    #[test]
    fn text_and_thinking_deltas_parse() {
        let t = json!({ "type": "content_block_delta", "index": 0,
            "delta": { "type": "text_delta", "text": "hello" } });
        assert_eq!(parse_event(&t), vec![Parsed::Text("hello".into())]);

        let th = json!({ "type": "content_block_delta", "index": 0,
            "delta": { "type": "thinking_delta", "thinking": "hmm" } });
        assert_eq!(parse_event(&th), vec![Parsed::Thinking("hmm".into())]);
    }

    #[test]
    fn signature_delta_never_becomes_text() {
        let v = json!({ "type": "content_block_delta", "index": 0,
            "delta": { "type": "signature_delta", "signature": "EqRkLm" } });
        assert_eq!(parse_event(&v), vec![Parsed::Signature("EqRkLm".into())]);
    }

    #[test]
    fn input_json_delta_routes_to_tool_arg() {
        let v = json!({ "type": "content_block_delta", "index": 1,
            "delta": { "type": "input_json_delta", "partial_json": "{\"k\":" } });
        assert_eq!(
            parse_event(&v),
            vec![Parsed::ToolArg {
                index: 1,
                json: "{\"k\":".into()
            }]
        );
    }

    #[test]
    fn message_delta_maps_stop_reasons() {
        let v = json!({ "type": "message_delta",
            "delta": { "stop_reason": "tool_use" }, "usage": { "output_tokens": 7 } });
        let parsed = parse_event(&v);
        assert!(parsed.contains(&Parsed::Stop(StopReason::ToolUse)));
        assert!(parsed.iter().any(|p| matches!(p, Parsed::Usage(u) if u.output == 7)));
    }

    #[test]
    fn max_tokens_stop_reason_maps() {
        let v = json!({ "type": "message_delta", "delta": { "stop_reason": "max_tokens" } });
        assert_eq!(parse_event(&v), vec![Parsed::Stop(StopReason::MaxTokens)]);
    }

    #[test]
    fn message_stop_is_done_and_ping_is_silent() {
        assert_eq!(parse_event(&json!({ "type": "message_stop" })), vec![Parsed::Done]);
        assert!(parse_event(&json!({ "type": "ping" })).is_empty());
    }

    #[test]
    fn error_event_parses_message() {
        let v = json!({ "type": "error", "error": { "type": "overloaded_error", "message": "Overloaded" } });
        assert_eq!(
            parse_event(&v),
            vec![Parsed::Error("Anthropic stream error: Overloaded".into())]
        );
    }

    // ── Request building ──────────────────────────────────────────────────────

    fn plain_context(messages: Vec<Message>) -> ProviderContext {
        ProviderContext {
            system_prompt: Some("be helpful".into()),
            messages,
            tools: vec![],
        }
    }

    #[test]
    fn body_carries_model_system_and_max_tokens() {
        let body = build_request_body(
            &opus(),
            &plain_context(vec![Message::user("hi")]),
            &StreamOptions::default(),
            false,
        );
        assert_eq!(body["model"], "claude-opus-4-6");
        assert_eq!(body["system"], "be helpful");
        assert_eq!(body["max_tokens"], 64000);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn retention_hint_wraps_system_in_cache_control_block() {
        let body = build_request_body(
            &opus(),
            &plain_context(vec![Message::user("hi")]),
            &StreamOptions::default(),
            true,
        );
        assert_eq!(body["system"][0]["cache_control"]["ttl"], "1h");
        assert_eq!(body["system"][0]["text"], "be helpful");
    }

    #[test]
    fn thinking_budget_set_for_reasoning_models() {
        let options = StreamOptions {
            thinking_level: ThinkingLevel::Medium,
            ..Default::default()
        };
        let body = build_request_body(
            &opus(),
            &plain_context(vec![Message::user("hi")]),
            &options,
            false,
        );
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["budget_tokens"], 12288);
    }

    #[test]
    fn thinking_off_omits_thinking_field() {
        let body = build_request_body(
            &opus(),
            &plain_context(vec![Message::user("hi")]),
            &StreamOptions::default(),
            false,
        );
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn tool_call_serialises_as_tool_use_block() {
        let mut args = serde_json::Map::new();
        args.insert("command".into(), json!("ls"));
        let msg = Message::Assistant(AssistantMessage {
            content: vec![ContentBlock::tool_call("toolu_1", "bash", args)],
            api: "anthropic-messages".into(),
            provider: "anthropic".into(),
            model: "claude-opus-4-6".into(),
            usage: TokenUsage::default(),
            stop_reason: StopReason::ToolUse,
            error_message: None,
            invalid_tool_call_ids: vec![],
            timestamp: Utc::now(),
        });
        let wire = build_wire_messages(&[msg]);
        let block = &wire[0]["content"][0];
        assert_eq!(block["type"], "tool_use");
        assert_eq!(block["id"], "toolu_1");
        assert_eq!(block["input"]["command"], "ls");
    }

    #[test]
    fn tool_result_becomes_user_tool_result_block() {
        let wire = build_wire_messages(&[Message::tool_result("toolu_1", "bash", "ok", false)]);
        assert_eq!(wire[0]["role"], "user");
        let block = &wire[0]["content"][0];
        assert_eq!(block["type"], "tool_result");
        assert_eq!(block["tool_use_id"], "toolu_1");
        assert_eq!(block["content"], "ok");
        assert_eq!(block["is_error"], false);
    }

    #[test]
    fn user_image_blocks_use_base64_source() {
        let msg = Message::user_with_blocks(vec![
            ContentBlock::text("see"),
            ContentBlock::Image {
                data: "AAAA".into(),
                mime: "image/png".into(),
            },
        ]);
        let wire = build_wire_messages(&[msg]);
        let img = &wire[0]["content"][1];
        assert_eq!(img["type"], "image");
        assert_eq!(img["source"]["type"], "base64");
        assert_eq!(img["source"]["media_type"], "image/png");
    }

    #[test]
    fn thinking_block_round_trips_signature() {
        let msg = Message::Assistant(AssistantMessage {
            content: vec![ContentBlock::Thinking {
                thinking: "step".into(),
                signature: Some("sig".into()),
            }],
            api: "anthropic-messages".into(),
            provider: "anthropic".into(),
            model: "claude-opus-4-6".into(),
            usage: TokenUsage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
            invalid_tool_call_ids: vec![],
            timestamp: Utc::now(),
        });
        let wire = build_wire_messages(&[msg]);
        assert_eq!(wire[0]["content"][0]["type"], "thinking");
        assert_eq!(wire[0]["content"][0]["signature"], "sig");
    }
}
