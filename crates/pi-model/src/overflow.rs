// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context-overflow detection from provider error bodies.

use crate::types::{AssistantMessage, StopReason};

/// Error phrases providers use when the request exceeds the model's context
/// window.  Matched case-insensitively against the assistant error message.
const OVERFLOW_PHRASES: &[&str] = &[
    // OpenAI / compatible
    "context_length_exceeded",
    "maximum context length",
    "context window",
    // Anthropic
    "prompt is too long",
    "exceeds the maximum number of tokens",
    // llama.cpp-compatible servers
    "exceed_context_size_error",
    // Gemini
    "input token count exceeds",
    // Groq / gateways
    "request too large",
    "too many tokens",
];

/// Returns `true` when an error assistant message reports a context-window
/// overflow.  Used to trigger forced compaction.
pub fn is_context_overflow(message: &AssistantMessage) -> bool {
    if message.stop_reason != StopReason::Error {
        return false;
    }
    let Some(err) = &message.error_message else {
        return false;
    };
    let lower = err.to_lowercase();
    OVERFLOW_PHRASES.iter().any(|p| lower.contains(p))
}
