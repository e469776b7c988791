// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! History transformer: rewrites a stored conversation so it can be replayed
//! against the active model.
//!
//! The same history must survive provider switches with different capability
//! matrices, so the transform (a) removes aborted turns, (b) closes every
//! tool call with a result, (c) rewrites tool-call ids where the target
//! provider constrains their syntax, (d) collapses non-portable thinking
//! blocks to text, and (e) converts or drops custom messages.  The function
//! is pure, deterministic, and idempotent for a fixed target.

use serde_json::Value;
use std::collections::HashSet;

use crate::{
    catalog::Model,
    types::{AssistantMessage, ContentBlock, Message, StopReason, ToolResultMessage},
};

/// Rewrites a tool-call id for the target model.  Must be pure and
/// deterministic; the transformer applies it to the call and its matching
/// result in the same pass.
pub type IdNormalizer<'a> = &'a dyn Fn(&str, &Model) -> String;

/// Maps a custom message `(role, payload)` to a wire message.  Returning
/// `None` drops the message.
pub type CustomConverter<'a> = &'a dyn Fn(&str, &Value) -> Option<Message>;

/// Text used for results synthesized for tool calls that never completed.
pub const SYNTHETIC_RESULT_TEXT: &str = "Tool execution was interrupted before a result was produced";

pub fn transform(
    messages: &[Message],
    target: &Model,
    id_normalizer: Option<IdNormalizer<'_>>,
    custom_converter: Option<CustomConverter<'_>>,
) -> Vec<Message> {
    let mut out = drop_aborted(messages);
    convert_custom(&mut out, custom_converter);
    synthesize_missing_results(&mut out);
    if let Some(normalize) = id_normalizer {
        normalize_ids(&mut out, target, normalize);
    }
    collapse_foreign_thinking(&mut out, target);
    out.retain(|m| match m {
        Message::Assistant(a) => !a.content.is_empty(),
        _ => true,
    });
    out
}

/// Rule 1: drop assistants that stopped with `Aborted`, along with user
/// messages that immediately followed one and were never answered (their
/// next message is another user message).  The trailing user message of the
/// history is always kept — it is the prompt about to be answered.
fn drop_aborted(messages: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        if let Message::Assistant(a) = &messages[i] {
            if a.stop_reason == StopReason::Aborted {
                i += 1;
                while i < messages.len() {
                    if messages[i].is_user() && next_is_user(&messages[i + 1..]) {
                        i += 1;
                        continue;
                    }
                    break;
                }
                continue;
            }
        }
        out.push(messages[i].clone());
        i += 1;
    }
    out
}

fn next_is_user(rest: &[Message]) -> bool {
    rest.iter()
        .find(|m| !matches!(m, Message::Custom { .. }))
        .map(Message::is_user)
        .unwrap_or(false)
}

/// Rule 2: every tool call must be answered before the next assistant turn.
/// Calls without a matching result get a synthetic error result inserted
/// directly after the run of results that follows their assistant message.
fn synthesize_missing_results(messages: &mut Vec<Message>) {
    let answered: HashSet<String> = messages
        .iter()
        .filter_map(|m| match m {
            Message::ToolResult(r) => Some(r.tool_call_id.clone()),
            _ => None,
        })
        .collect();

    let mut i = 0;
    while i < messages.len() {
        let missing: Vec<(String, String)> = match &messages[i] {
            Message::Assistant(a) => a
                .tool_calls()
                .into_iter()
                .filter(|(id, _, _)| !answered.contains(*id))
                .map(|(id, name, _)| (id.to_string(), name.to_string()))
                .collect(),
            _ => vec![],
        };
        i += 1;
        if missing.is_empty() {
            continue;
        }
        // Skip past results that did arrive so synthesized ones extend the
        // same result run.
        while i < messages.len() && matches!(messages[i], Message::ToolResult(_)) {
            i += 1;
        }
        for (id, name) in missing {
            let timestamp = messages[i - 1].timestamp();
            messages.insert(
                i,
                Message::ToolResult(ToolResultMessage {
                    tool_call_id: id,
                    tool_name: name,
                    content: vec![ContentBlock::text(SYNTHETIC_RESULT_TEXT)],
                    is_error: true,
                    details: None,
                    timestamp,
                }),
            );
            i += 1;
        }
    }
}

/// Rule 3: rewrite call and result ids atomically.
fn normalize_ids(messages: &mut [Message], target: &Model, normalize: IdNormalizer<'_>) {
    for m in messages.iter_mut() {
        match m {
            Message::Assistant(a) => {
                for block in a.content.iter_mut() {
                    if let ContentBlock::ToolCall { id, .. } = block {
                        *id = normalize(id, target);
                    }
                }
            }
            Message::ToolResult(r) => {
                r.tool_call_id = normalize(&r.tool_call_id, target);
            }
            _ => {}
        }
    }
}

/// Rule 4: thinking signatures are only meaningful to the provider/model
/// that produced them.  Everywhere else the block collapses to plain text
/// (dropped when blank); redacted thinking has no readable text and is
/// dropped outright.
fn collapse_foreign_thinking(messages: &mut [Message], target: &Model) {
    for m in messages.iter_mut() {
        let Message::Assistant(a) = m else { continue };
        if !thinking_is_foreign(a, target) {
            continue;
        }
        let blocks = std::mem::take(&mut a.content);
        a.content = blocks
            .into_iter()
            .filter_map(|b| match b {
                ContentBlock::Thinking { thinking, .. } => {
                    let trimmed = thinking.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        Some(ContentBlock::text(trimmed.to_string()))
                    }
                }
                ContentBlock::RedactedThinking { .. } => None,
                other => Some(other),
            })
            .collect();
    }
}

fn thinking_is_foreign(a: &AssistantMessage, target: &Model) -> bool {
    a.provider != target.provider
        || a.model != target.id
        || target.compat.requires_thinking_as_text
}

/// Rule 5: custom messages are opaque to providers; a converter may map a
/// role to a wire message, otherwise the message is dropped.
fn convert_custom(messages: &mut Vec<Message>, converter: Option<CustomConverter<'_>>) {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages.drain(..) {
        match m {
            Message::Custom { role, payload, .. } => {
                if let Some(conv) = converter {
                    if let Some(wire) = conv(&role, &payload) {
                        out.push(wire);
                    }
                }
            }
            other => out.push(other),
        }
    }
    *messages = out;
}

impl Message {
    fn timestamp(&self) -> chrono::DateTime<chrono::Utc> {
        match self {
            Message::User { timestamp, .. }
            | Message::Custom { timestamp, .. } => *timestamp,
            Message::Assistant(a) => a.timestamp,
            Message::ToolResult(r) => r.timestamp,
        }
    }
}

/// Tool-call id normalizer for endpoints with constrained id syntax.
///
/// Mistral requires exactly nine alphanumeric characters; other providers
/// accept ids matching `[a-zA-Z0-9_-]+`.  The mapping is deterministic so
/// the call and its result always agree.
pub fn normalize_tool_call_id(id: &str, target: &Model) -> String {
    if target.compat.requires_mistral_tool_ids {
        let mut cleaned: String = id.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        while cleaned.len() < 9 {
            cleaned.push('0');
        }
        cleaned.truncate(9);
        cleaned
    } else {
        id.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
