// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tool::{Tool, ToolResult, UpdateFn};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

/// Lines preserved from each end of oversized output.  Errors and summaries
/// almost always appear at the end of build/test output, so the tail is at
/// least as important as the head.
const HEAD_LINES: usize = 100;
const TAIL_LINES: usize = 100;

/// Built-in tool that runs a shell command.  Also backs the session's
/// direct `execute_bash` pass-through.
pub struct BashTool {
    pub timeout_secs: u64,
}

impl Default for BashTool {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn label(&self) -> &str {
        "Bash"
    }

    fn description(&self) -> &str {
        "Execute a bash command and return stdout + stderr.\n\
         Output is capped at ~20 KB; when larger, the first 100 and last 100 lines\n\
         are preserved with an omission marker in the middle.\n\
         Prefer non-interactive commands; avoid commands that require a TTY."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash command to execute."
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        params: Value,
        cancel: CancellationToken,
        on_update: Option<UpdateFn>,
    ) -> ToolResult {
        let Some(command) = params.get("command").and_then(Value::as_str) else {
            return ToolResult::err("missing required parameter 'command'");
        };
        let timeout = params
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(self.timeout_secs);

        debug!(cmd = %command, "executing bash tool");

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            // fd 0 at /dev/null keeps subprocesses from touching the
            // controlling terminal.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("failed to spawn bash: {e}")),
        };
        let mut stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");

        let reader = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let _ = tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
            (out, err)
        };

        let deadline = tokio::time::sleep(std::time::Duration::from_secs(timeout));
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return ToolResult::err("command aborted");
            }
            _ = deadline => {
                let _ = child.kill().await;
                return ToolResult::err(format!("command timed out after {timeout}s"));
            }
            (out, err) = reader => {
                let status = child.wait().await.ok();
                let exit_code = status.and_then(|s| s.code());
                let mut combined = String::from_utf8_lossy(&out).to_string();
                if !err.is_empty() {
                    if !combined.is_empty() && !combined.ends_with('\n') {
                        combined.push('\n');
                    }
                    combined.push_str(&String::from_utf8_lossy(&err));
                }
                let truncated = combined.len() > OUTPUT_LIMIT_BYTES;
                let output = if truncated {
                    head_tail(&combined)
                } else {
                    combined
                };
                if let Some(update) = &on_update {
                    update(json!({ "exitCode": exit_code }));
                }
                let details = json!({
                    "exitCode": exit_code,
                    "truncated": truncated,
                });
                match exit_code {
                    Some(0) => ToolResult::ok(output).with_details(details),
                    code => {
                        let mut r = ToolResult::err(format!(
                            "{output}\n[exit code: {}]",
                            code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into())
                        ));
                        r.details = Some(details);
                        r
                    }
                }
            }
        }
    }
}

/// Keep the first and last lines of oversized output with an omission
/// marker in between.
fn head_tail(s: &str) -> String {
    let lines: Vec<&str> = s.lines().collect();
    if lines.len() <= HEAD_LINES + TAIL_LINES {
        // Few but huge lines: hard cap at the byte limit.
        let mut cut = OUTPUT_LIMIT_BYTES.min(s.len());
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        return format!("{}\n[... output truncated ...]", &s[..cut]);
    }
    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[lines.len() - TAIL_LINES..].join("\n");
    let omitted = lines.len() - HEAD_LINES - TAIL_LINES;
    format!("{head}\n[... {omitted} lines omitted ...]\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
