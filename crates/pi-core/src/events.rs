// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use pi_model::{Message, ToolResultMessage};
use serde::Serialize;
use serde_json::Value;

/// A streamed delta inside one assistant message.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "delta", rename_all = "snake_case")]
pub enum MessageDelta {
    Text { text: String },
    Thinking { thinking: String },
    ToolCallArgs { tool_call_id: String, args: String },
}

/// Events emitted by the agent.  Consumers (interactive front-end, print
/// mode, RPC) subscribe through the [`crate::EventBus`]; the serialized
/// form is the RPC event stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStart,
    AgentEnd,
    TurnStart,
    TurnEnd,
    MessageStart {
        message: Message,
    },
    MessageUpdate {
        #[serde(flatten)]
        delta: MessageDelta,
    },
    MessageEnd {
        message: Message,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        partial: Value,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        result: ToolResultMessage,
    },
    /// A transient provider failure is being retried with back-off.
    Retry {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// Older history was replaced by a summary message.
    Compaction {
        tokens_before: u64,
        forced: bool,
    },
    /// A hook handler failed; the turn continues.
    HookError {
        hook: String,
        event: String,
        error: String,
    },
    /// This subscriber fell behind and `skipped` events were dropped.
    LagWarning {
        skipped: u64,
    },
}

impl AgentEvent {
    /// Stable event-type string as rendered on the RPC stream.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::AgentStart => "agent_start",
            Self::AgentEnd => "agent_end",
            Self::TurnStart => "turn_start",
            Self::TurnEnd => "turn_end",
            Self::MessageStart { .. } => "message_start",
            Self::MessageUpdate { .. } => "message_update",
            Self::MessageEnd { .. } => "message_end",
            Self::ToolExecutionStart { .. } => "tool_execution_start",
            Self::ToolExecutionUpdate { .. } => "tool_execution_update",
            Self::ToolExecutionEnd { .. } => "tool_execution_end",
            Self::Retry { .. } => "retry",
            Self::Compaction { .. } => "compaction",
            Self::HookError { .. } => "hook_error",
            Self::LagWarning { .. } => "lag_warning",
        }
    }
}
