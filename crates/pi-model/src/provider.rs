// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::Model,
    stream::AssistantEventStream,
    types::{Message, ToolSchema},
};

/// Thinking effort requested from reasoning models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    pub fn cycle(self) -> Self {
        match self {
            Self::Off => Self::Low,
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High => Self::Off,
        }
    }

    /// Thinking-budget tokens for providers that take an explicit budget.
    pub fn budget_tokens(self) -> Option<u32> {
        match self {
            Self::Off => None,
            Self::Low => Some(4_096),
            Self::Medium => Some(12_288),
            Self::High => Some(32_768),
        }
    }

    /// Effort string for providers that take a reasoning-effort field.
    pub fn effort(self) -> Option<&'static str> {
        match self {
            Self::Off => None,
            Self::Low => Some("low"),
            Self::Medium => Some("medium"),
            Self::High => Some("high"),
        }
    }
}

/// The conversation context sent with one completion request.  `messages`
/// must already be transformed for the target model (see
/// [`crate::transform::transform`]).
#[derive(Debug, Clone, Default)]
pub struct ProviderContext {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
}

/// Per-request options.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Explicit API key; when `None` the adapter resolves the provider's
    /// default key environment variable.
    pub api_key: Option<String>,
    /// Base-URL override for proxies and gateways.  Cache-retention hints
    /// are only sent to official endpoints.
    pub base_url: Option<String>,
    /// Stable session identifier, forwarded to providers that support
    /// prompt-cache retention keyed by session.
    pub session_id: Option<String>,
    pub thinking_level: ThinkingLevel,
    /// Output-token cap override; defaults to the model's catalog value.
    pub max_tokens: Option<u32>,
    /// Cancelling this token closes the underlying transport; the stream
    /// finishes with `Done { reason: Aborted, .. }`.
    pub cancel: CancellationToken,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            session_id: None,
            thinking_level: ThinkingLevel::Off,
            max_tokens: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// A provider adapter: exactly two operations.
///
/// `stream` drives a full conversation turn; `stream_simple` is the trivial
/// wrapper used for utility calls (compaction summaries, model scans).
/// Implementations must uphold the stream contract documented on
/// [`AssistantEventStream`]: `Done` exactly once, errors and cancellation
/// in-band, never through the iterator.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Wire protocol identifier this adapter serves (`Model::api`).
    fn api(&self) -> &str;

    async fn stream(
        &self,
        model: &Model,
        context: ProviderContext,
        options: StreamOptions,
    ) -> anyhow::Result<AssistantEventStream>;

    async fn stream_simple(
        &self,
        model: &Model,
        prompt: &str,
    ) -> anyhow::Result<AssistantEventStream> {
        let context = ProviderContext {
            system_prompt: None,
            messages: vec![Message::user(prompt)],
            tools: vec![],
        };
        self.stream(model, context, StreamOptions::default()).await
    }
}
