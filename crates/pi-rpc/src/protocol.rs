// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire types for the RPC front-end.
//!
//! Input: one JSON object per line, `{"type": "<command>", "id"?: ...,
//! ...params}`.  Output: `response` objects correlated by `id`, interleaved
//! with the serialized session event stream.

use std::path::PathBuf;

use pi_config::QueueMode;
use pi_model::ThinkingLevel;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One request line.  The `id` is echoed on the response.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub command: RpcCommand,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcCommand {
    #[serde(rename_all = "camelCase")]
    Prompt {
        message: String,
        #[serde(default)]
        images: Vec<RpcImage>,
    },
    Steer {
        message: String,
    },
    FollowUp {
        message: String,
    },
    Abort,
    #[serde(rename_all = "camelCase")]
    NewSession {
        #[serde(default)]
        parent_session: Option<PathBuf>,
    },
    GetState,
    #[serde(rename_all = "camelCase")]
    SetSessionName {
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    SetModel {
        provider: String,
        model_id: String,
    },
    CycleModel,
    GetAvailableModels,
    #[serde(rename_all = "camelCase")]
    SetThinkingLevel {
        level: ThinkingLevel,
    },
    CycleThinkingLevel,
    #[serde(rename_all = "camelCase")]
    SetSteeringMode {
        mode: QueueMode,
    },
    #[serde(rename_all = "camelCase")]
    SetFollowUpMode {
        mode: QueueMode,
    },
    #[serde(rename_all = "camelCase")]
    Compact {
        #[serde(default)]
        custom_instructions: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SetAutoCompaction {
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    SetAutoRetry {
        enabled: bool,
    },
    AbortRetry,
    Bash {
        command: String,
    },
    AbortBash,
    GetSessionStats,
    #[serde(rename_all = "camelCase")]
    ExportHtml {
        #[serde(default)]
        output_path: Option<PathBuf>,
    },
    #[serde(rename_all = "camelCase")]
    SwitchSession {
        session_path: PathBuf,
    },
    #[serde(rename_all = "camelCase")]
    Fork {
        entry_id: String,
    },
    GetForkMessages,
    GetLastAssistantText,
    GetMessages,
    GetCommands,
    #[serde(rename_all = "camelCase")]
    HookUiResponse {
        #[serde(flatten)]
        payload: Value,
    },
}

impl RpcCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prompt { .. } => "prompt",
            Self::Steer { .. } => "steer",
            Self::FollowUp { .. } => "follow_up",
            Self::Abort => "abort",
            Self::NewSession { .. } => "new_session",
            Self::GetState => "get_state",
            Self::SetSessionName { .. } => "set_session_name",
            Self::SetModel { .. } => "set_model",
            Self::CycleModel => "cycle_model",
            Self::GetAvailableModels => "get_available_models",
            Self::SetThinkingLevel { .. } => "set_thinking_level",
            Self::CycleThinkingLevel => "cycle_thinking_level",
            Self::SetSteeringMode { .. } => "set_steering_mode",
            Self::SetFollowUpMode { .. } => "set_follow_up_mode",
            Self::Compact { .. } => "compact",
            Self::SetAutoCompaction { .. } => "set_auto_compaction",
            Self::SetAutoRetry { .. } => "set_auto_retry",
            Self::AbortRetry => "abort_retry",
            Self::Bash { .. } => "bash",
            Self::AbortBash => "abort_bash",
            Self::GetSessionStats => "get_session_stats",
            Self::ExportHtml { .. } => "export_html",
            Self::SwitchSession { .. } => "switch_session",
            Self::Fork { .. } => "fork",
            Self::GetForkMessages => "get_fork_messages",
            Self::GetLastAssistantText => "get_last_assistant_text",
            Self::GetMessages => "get_messages",
            Self::GetCommands => "get_commands",
            Self::HookUiResponse { .. } => "hook_ui_response",
        }
    }
}

/// An image attached to a prompt: raw base64 plus its mime type.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcImage {
    pub data: String,
    pub mime: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub command: &'static str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: Option<Value>, command: &'static str, data: Option<Value>) -> Self {
        Self {
            kind: "response",
            id,
            command,
            success: true,
            data,
            error: None,
        }
    }

    pub fn err(id: Option<Value>, command: &'static str, error: impl Into<String>) -> Self {
        Self {
            kind: "response",
            id,
            command,
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
