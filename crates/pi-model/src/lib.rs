// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Message model, provider adapters, and the history-transform layer.
//!
//! The normalized model ([`Message`], [`ContentBlock`]) is what the agent
//! loop and session store operate on; adapters translate it to each
//! provider's wire format and stream [`AssistantEvent`]s back.  The
//! [`transform`] module rewrites stored history so it replays cleanly
//! against models with different capability matrices.

pub mod catalog;
pub mod mock;
pub mod overflow;
pub mod registry;
pub mod sanitize;
pub mod transform;

mod anthropic;
mod openai;
mod provider;
mod responses;
mod sse;
mod stream;
mod types;

pub use anthropic::AnthropicProvider;
pub use catalog::{Compat, InputModality, MaxTokensField, Model};
pub use mock::{MockProvider, ScriptedProvider, ScriptedTurn};
pub use openai::{gateway_for, OpenAiCompletionsProvider, GATEWAYS};
pub use overflow::is_context_overflow;
pub use provider::{Provider, ProviderContext, StreamOptions, ThinkingLevel};
pub use responses::OpenAiResponsesProvider;
pub use stream::{AssistantEvent, AssistantEventStream, EventSink};
pub use types::*;

/// `PI_CACHE_RETENTION=long` opts the process into long-lived prompt-cache
/// hints.  Adapters only send the hints to official endpoints.
pub fn cache_retention_long() -> bool {
    std::env::var("PI_CACHE_RETENTION")
        .map(|v| v == "long")
        .unwrap_or(false)
}
