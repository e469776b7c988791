// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Single-call tool execution: validation, hook veto, cancellation, and
//! event emission.  Batch sequencing (including the skip-on-steer rule)
//! lives in the agent loop.

use std::sync::Arc;

use chrono::Utc;
use pi_model::{ContentBlock, ToolResultMessage};
use pi_tools::{schema, Tool, ToolResult, ToolResultPart};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::events::AgentEvent;
use crate::hooks::{HookDecision, HookRunner};

/// Result text for calls skipped because a queued user message (or an
/// abort) made the rest of the batch moot.
pub const SKIPPED_RESULT_TEXT: &str = "Skipped due to queued user message";

/// A skipped call: no execution events are emitted, only the error result.
pub fn skipped_result(tool_call_id: &str, tool_name: &str) -> ToolResultMessage {
    ToolResultMessage {
        tool_call_id: tool_call_id.to_string(),
        tool_name: tool_name.to_string(),
        content: vec![ContentBlock::text(SKIPPED_RESULT_TEXT)],
        is_error: true,
        details: None,
        timestamp: Utc::now(),
    }
}

/// Execute one tool call end-to-end: `tool_execution_start`, optional
/// updates, `tool_execution_end`.  Every failure mode — unknown tool,
/// malformed argument JSON, schema mismatch, hook veto, tool-reported
/// error — is materialized as an error result the model can read.
pub async fn run_tool_call(
    tool: Option<Arc<dyn Tool>>,
    hooks: Option<Arc<HookRunner>>,
    bus: &EventBus,
    cancel: &CancellationToken,
    tool_call_id: &str,
    tool_name: &str,
    args: Map<String, Value>,
    arguments_were_invalid: bool,
) -> ToolResultMessage {
    let args_value = Value::Object(args);
    bus.emit(AgentEvent::ToolExecutionStart {
        tool_call_id: tool_call_id.to_string(),
        tool_name: tool_name.to_string(),
        args: args_value.clone(),
    });

    let result = execute_validated(
        tool,
        hooks.clone(),
        bus,
        cancel,
        tool_call_id,
        tool_name,
        args_value,
        arguments_were_invalid,
    )
    .await;

    if let Some(hooks) = &hooks {
        hooks
            .tool_post(tool_name, &result.text(), result.is_error)
            .await;
    }

    let message = to_result_message(tool_call_id, tool_name, result);
    bus.emit(AgentEvent::ToolExecutionEnd {
        tool_call_id: tool_call_id.to_string(),
        result: message.clone(),
    });
    message
}

#[allow(clippy::too_many_arguments)]
async fn execute_validated(
    tool: Option<Arc<dyn Tool>>,
    hooks: Option<Arc<HookRunner>>,
    bus: &EventBus,
    cancel: &CancellationToken,
    tool_call_id: &str,
    tool_name: &str,
    args: Value,
    arguments_were_invalid: bool,
) -> ToolResult {
    if arguments_were_invalid {
        return ToolResult::err(format!(
            "Arguments for tool {tool_name} were not valid JSON and could not be repaired."
        ));
    }
    let Some(tool) = tool else {
        return ToolResult::err(format!("Unknown tool: {tool_name}"));
    };

    if let Some(hooks) = &hooks {
        if let HookDecision::Block { reason } = hooks.tool_pre(tool_name, &args).await {
            return ToolResult::err(format!("Tool call blocked: {reason}"));
        }
    }

    let params = match schema::validate(&tool.parameters_schema(), &args, true) {
        Ok(coerced) => coerced,
        Err(errors) => {
            let mut msg = format!("Invalid arguments for tool {tool_name}:");
            for e in errors {
                msg.push_str("\n- ");
                msg.push_str(&e);
            }
            return ToolResult::err(msg);
        }
    };

    let update_bus = bus.clone();
    let update_id = tool_call_id.to_string();
    let on_update: pi_tools::UpdateFn = Arc::new(move |partial| {
        update_bus.emit(AgentEvent::ToolExecutionUpdate {
            tool_call_id: update_id.clone(),
            partial,
        });
    });

    tool.execute(tool_call_id, params, cancel.child_token(), Some(on_update))
        .await
}

fn to_result_message(tool_call_id: &str, tool_name: &str, result: ToolResult) -> ToolResultMessage {
    let content: Vec<ContentBlock> = result
        .parts
        .into_iter()
        .map(|p| match p {
            ToolResultPart::Text(text) => ContentBlock::text(text),
            ToolResultPart::Image { data, mime } => ContentBlock::Image { data, mime },
        })
        .collect();
    ToolResultMessage {
        tool_call_id: tool_call_id.to_string(),
        tool_name: tool_name.to_string(),
        content,
        is_error: result.is_error,
        details: result.details,
        timestamp: Utc::now(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
