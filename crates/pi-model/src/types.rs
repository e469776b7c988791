// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A single content block inside a message.
///
/// Assistant messages are a sequence of blocks; user messages are either a
/// plain string or a block list (for text + image turns).  The `ToolCall`
/// block's `id` is assigned by the model and links the call to its later
/// `toolResult` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        /// Provider-specific opaque token authenticating the reasoning
        /// content.  Not portable across providers; the transformer drops it
        /// when replaying history against a different api.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Map<String, Value>,
    },
    Image {
        /// Raw base64 payload (no `data:` URL prefix).
        data: String,
        mime: String,
    },
    Document {
        data: String,
        mime: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

// ─── Assistant message ────────────────────────────────────────────────────────

/// Why an assistant message stopped streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Stop,
    ToolUse,
    Error,
    Aborted,
    MaxTokens,
}

/// Token usage from one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
    /// Tokens served from the provider's prompt cache (read hit).
    #[serde(default)]
    pub cache_read: u32,
    /// Tokens written into the provider's prompt cache.
    #[serde(default)]
    pub cache_write: u32,
}

impl TokenUsage {
    /// Merge a streamed usage update into the running total.  Providers may
    /// report input and output counts in separate events.
    pub fn merge(&mut self, other: TokenUsage) {
        self.input = self.input.max(other.input);
        self.output = self.output.max(other.output);
        self.cache_read = self.cache_read.max(other.cache_read);
        self.cache_write = self.cache_write.max(other.cache_write);
    }
}

/// One complete assistant message, assembled from a provider stream.
///
/// `api` / `provider` / `model` record which endpoint produced the message so
/// that history replay against a different model can apply the right
/// transformations (thinking portability, tool-call id syntax).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub api: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub usage: TokenUsage,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Tool-call ids whose streamed argument JSON could not be parsed even
    /// after repair.  The executor turns these into error tool results
    /// without invoking the tool.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalid_tool_call_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl AssistantMessage {
    /// Concatenation of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// All tool-call blocks in emission order.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &Map<String, Value>)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some((id.as_str(), name.as_str(), arguments)),
                _ => None,
            })
            .collect()
    }
}

// ─── User / tool-result / custom messages ─────────────────────────────────────

/// User content: a plain string for the common case, or a block list when
/// the turn carries images.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl UserContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Blocks(blocks) => match blocks.as_slice() {
                [ContentBlock::Text { text }] => Some(text),
                _ => None,
            },
        }
    }
}

/// The result of one tool call, paired to its `ToolCall` block by
/// `tool_call_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl ToolResultMessage {
    /// Concatenation of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum Message {
    User {
        content: UserContent,
        timestamp: DateTime<Utc>,
    },
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
    /// Opaque to the agent loop.  Skipped when building provider input
    /// unless the caller supplies a converter for the role.
    Custom {
        #[serde(rename = "customRole")]
        role: String,
        payload: Value,
        timestamp: DateTime<Utc>,
    },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: UserContent::Text(text.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn user_with_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::User {
            content: UserContent::Blocks(blocks),
            timestamp: Utc::now(),
        }
    }

    pub fn custom(role: impl Into<String>, payload: Value) -> Self {
        Self::Custom {
            role: role.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult(ToolResultMessage {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: vec![ContentBlock::text(text)],
            is_error,
            details: None,
            timestamp: Utc::now(),
        })
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Self::Assistant(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User { .. })
    }

    /// Approximate token count used for context management (4 chars/token,
    /// images estimated at a flat block cost).
    pub fn approx_tokens(&self) -> usize {
        let chars = match self {
            Self::User { content, .. } => user_content_chars(content),
            Self::Assistant(m) => blocks_chars(&m.content),
            Self::ToolResult(r) => blocks_chars(&r.content),
            Self::Custom { payload, .. } => payload.to_string().len(),
        };
        (chars / 4).max(1)
    }
}

fn user_content_chars(content: &UserContent) -> usize {
    match content {
        UserContent::Text(t) => t.len(),
        UserContent::Blocks(blocks) => blocks_chars(blocks),
    }
}

fn blocks_chars(blocks: &[ContentBlock]) -> usize {
    blocks
        .iter()
        .map(|b| match b {
            ContentBlock::Text { text } => text.len(),
            ContentBlock::Thinking { thinking, .. } => thinking.len(),
            ContentBlock::RedactedThinking { data } => data.len(),
            ContentBlock::ToolCall {
                name, arguments, ..
            } => name.len() + Value::Object(arguments.clone()).to_string().len(),
            // Images cost hundreds of tokens regardless of byte size;
            // 765 tokens is the usual high-detail estimate.
            ContentBlock::Image { .. } => 765 * 4,
            ContentBlock::Document { data, .. } => data.len() / 2,
        })
        .sum()
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
