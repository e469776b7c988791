// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Line-delimited JSON server over stdin/stdout.
//!
//! Commands are handled before the next line is read, except the
//! long-running ones (`prompt`, `steer`, `follow_up`, `bash`) which respond
//! immediately with `success: true` and stream their progress through the
//! event fan-out, ending with `agent_end`.

use std::sync::Arc;

use pi_core::{AgentSession, PromptOptions};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

use crate::protocol::{RpcCommand, RpcRequest, RpcResponse};

/// Serve the session until stdin closes.
pub async fn run(session: Arc<AgentSession>) -> anyhow::Result<()> {
    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    // Single writer task: responses and events share stdout, one JSON
    // object per line.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    // Event pump: every bus event becomes one output line.
    let event_tx = out_tx.clone();
    let mut subscriber = session.subscribe();
    let pump = tokio::spawn(async move {
        while let Some(envelope) = subscriber.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(line) => {
                    if event_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("failed to serialize event: {e}"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => dispatch(&session, request).await,
            Err(e) => {
                let id = serde_json::from_str::<Value>(&line)
                    .ok()
                    .and_then(|v| v.get("id").cloned());
                RpcResponse::err(id, "unknown", format!("malformed request: {e}"))
            }
        };
        let line = serde_json::to_string(&response)?;
        if out_tx.send(line).is_err() {
            break;
        }
    }

    pump.abort();
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// Execute one command against the session.
pub async fn dispatch(session: &Arc<AgentSession>, request: RpcRequest) -> RpcResponse {
    let id = request.id;
    let command = request.command.name();
    match request.command {
        RpcCommand::Prompt { message, images } => {
            let options = PromptOptions {
                expand_slash_commands: true,
                images: images.into_iter().map(|i| (i.data, i.mime)).collect(),
            };
            match session.prompt(&message, options) {
                Ok(_handle) => RpcResponse::ok(id, command, None),
                Err(e) => RpcResponse::err(id, command, e.to_string()),
            }
        }
        RpcCommand::Steer { message } => {
            session.steer(&message);
            RpcResponse::ok(id, command, None)
        }
        RpcCommand::FollowUp { message } => {
            session.follow_up(&message);
            RpcResponse::ok(id, command, None)
        }
        RpcCommand::Abort => {
            session.abort();
            RpcResponse::ok(id, command, None)
        }
        RpcCommand::NewSession { parent_session } => {
            let result = match parent_session {
                Some(path) => match session.switch_session(&path).await {
                    Ok(_) => session.new_session(),
                    Err(e) => Err(e),
                },
                None => session.new_session(),
            };
            match result {
                Ok(session_id) => {
                    RpcResponse::ok(id, command, Some(json!({ "sessionId": session_id })))
                }
                Err(e) => RpcResponse::err(id, command, e.to_string()),
            }
        }
        RpcCommand::GetState => match serde_json::to_value(session.get_state()) {
            Ok(state) => RpcResponse::ok(id, command, Some(state)),
            Err(e) => RpcResponse::err(id, command, e.to_string()),
        },
        RpcCommand::SetSessionName { name } => {
            session.set_session_name(&name);
            RpcResponse::ok(id, command, None)
        }
        RpcCommand::SetModel { provider, model_id } => {
            match session.set_model(&provider, &model_id) {
                Ok(model) => RpcResponse::ok(
                    id,
                    command,
                    Some(json!({ "model": model.qualified_id() })),
                ),
                Err(e) => RpcResponse::err(id, command, e.to_string()),
            }
        }
        RpcCommand::CycleModel => match session.cycle_model(1) {
            Ok(model) => RpcResponse::ok(
                id,
                command,
                Some(json!({ "model": model.qualified_id() })),
            ),
            Err(e) => RpcResponse::err(id, command, e.to_string()),
        },
        RpcCommand::GetAvailableModels => {
            let models: Vec<Value> = session
                .get_available_models()
                .iter()
                .map(|m| {
                    json!({
                        "provider": m.provider,
                        "modelId": m.id,
                        "name": m.name,
                        "contextWindow": m.context_window,
                        "reasoning": m.reasoning,
                    })
                })
                .collect();
            RpcResponse::ok(id, command, Some(json!({ "models": models })))
        }
        RpcCommand::SetThinkingLevel { level } => {
            session.set_thinking_level(level);
            RpcResponse::ok(id, command, None)
        }
        RpcCommand::CycleThinkingLevel => {
            let level = session.cycle_thinking_level();
            RpcResponse::ok(id, command, Some(json!({ "thinkingLevel": level })))
        }
        RpcCommand::SetSteeringMode { mode } => {
            session.set_steering_mode(mode);
            RpcResponse::ok(id, command, None)
        }
        RpcCommand::SetFollowUpMode { mode } => {
            session.set_follow_up_mode(mode);
            RpcResponse::ok(id, command, None)
        }
        RpcCommand::Compact {
            custom_instructions,
        } => match session.compact(custom_instructions).await {
            Ok(result) => RpcResponse::ok(
                id,
                command,
                Some(serde_json::to_value(result).unwrap_or_default()),
            ),
            Err(e) => RpcResponse::err(id, command, e.to_string()),
        },
        RpcCommand::SetAutoCompaction { enabled } => {
            session.set_auto_compaction(enabled);
            RpcResponse::ok(id, command, None)
        }
        RpcCommand::SetAutoRetry { enabled } => {
            session.set_auto_retry(enabled);
            RpcResponse::ok(id, command, None)
        }
        RpcCommand::AbortRetry => {
            session.abort_retry();
            RpcResponse::ok(id, command, None)
        }
        RpcCommand::Bash { command: shell } => {
            // Respond immediately; the execution is visible in history and
            // the event stream once it lands.
            let session = Arc::clone(session);
            tokio::spawn(async move {
                if let Err(e) = session.execute_bash(&shell).await {
                    warn!("bash pass-through failed: {e}");
                }
            });
            RpcResponse::ok(id, command, None)
        }
        RpcCommand::AbortBash => {
            session.abort_bash();
            RpcResponse::ok(id, command, None)
        }
        RpcCommand::GetSessionStats => match serde_json::to_value(session.get_session_stats()) {
            Ok(stats) => RpcResponse::ok(id, command, Some(stats)),
            Err(e) => RpcResponse::err(id, command, e.to_string()),
        },
        RpcCommand::ExportHtml { output_path } => match session.export_to_html(output_path) {
            Ok(path) => RpcResponse::ok(id, command, Some(json!({ "path": path }))),
            Err(e) => RpcResponse::err(id, command, e.to_string()),
        },
        RpcCommand::SwitchSession { session_path } => {
            match session.switch_session(&session_path).await {
                Ok(session_id) => {
                    RpcResponse::ok(id, command, Some(json!({ "sessionId": session_id })))
                }
                Err(e) => RpcResponse::err(id, command, e.to_string()),
            }
        }
        RpcCommand::Fork { entry_id } => match session.fork(&entry_id) {
            Ok(result) => RpcResponse::ok(
                id,
                command,
                Some(serde_json::to_value(result).unwrap_or_default()),
            ),
            Err(e) => RpcResponse::err(id, command, e.to_string()),
        },
        RpcCommand::GetForkMessages => {
            let messages = session.get_user_messages_for_forking();
            RpcResponse::ok(
                id,
                command,
                Some(json!({
                    "messages": serde_json::to_value(messages).unwrap_or_default()
                })),
            )
        }
        RpcCommand::GetLastAssistantText => RpcResponse::ok(
            id,
            command,
            Some(json!({ "text": session.get_last_assistant_text() })),
        ),
        RpcCommand::GetMessages => match serde_json::to_value(session.get_messages()) {
            Ok(messages) => RpcResponse::ok(id, command, Some(json!({ "messages": messages }))),
            Err(e) => RpcResponse::err(id, command, e.to_string()),
        },
        RpcCommand::GetCommands => {
            let commands: Vec<Value> = session
                .get_commands()
                .into_iter()
                .map(|(name, description)| json!({ "name": name, "description": description }))
                .collect();
            RpcResponse::ok(id, command, Some(json!({ "commands": commands })))
        }
        // No built-in hook requests UI delegation; accept the reply so
        // drivers can send it unconditionally.
        RpcCommand::HookUiResponse { .. } => RpcResponse::ok(id, command, None),
    }
}
