// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Compaction: replace the older prefix of a conversation with a single
//! summary message so the history fits the model's context window.

use pi_model::Message;

/// Outcome of a compaction pass.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactResult {
    pub summary: String,
    /// Entries at or after this id survive verbatim; everything older is
    /// represented by the summary.
    pub first_kept_entry_id: String,
    pub tokens_before: u64,
}

/// Index of the first message kept verbatim.  Returns `None` when the
/// history is too short to be worth summarizing.
///
/// The split is adjusted backward until the kept tail begins at a
/// conversation-turn boundary: a tail that opens with a tool result would
/// reference tool calls that were summarized away, which providers reject
/// as unmatched results.
pub fn compaction_split(messages: &[Message], keep_recent: usize) -> Option<usize> {
    if messages.len() <= keep_recent * 2 {
        return None;
    }
    let mut split = messages.len() - keep_recent;
    while split > 0 && matches!(messages[split], Message::ToolResult(_)) {
        split -= 1;
    }
    if split == 0 {
        return None;
    }
    Some(split)
}

/// Prompt sent through `stream_simple` to produce the summary.
pub fn compaction_prompt(to_summarize: &[Message], custom_instructions: Option<&str>) -> String {
    let mut prompt = String::from(
        "Summarize the conversation below so it can replace the original \
         messages as context for continuing the session. Preserve: the \
         user's goals and constraints, decisions made, file paths and \
         commands that were touched, open problems, and anything the \
         assistant promised to do. Be concise but complete; write plain \
         prose, no preamble.\n",
    );
    if let Some(instructions) = custom_instructions {
        if !instructions.trim().is_empty() {
            prompt.push_str("\nAdditional instructions: ");
            prompt.push_str(instructions.trim());
            prompt.push('\n');
        }
    }
    prompt.push_str("\n--- conversation ---\n");
    prompt.push_str(&render_messages(to_summarize));
    prompt
}

/// Flat text rendering of a message slice for the summary prompt.
pub fn render_messages(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        match m {
            Message::User { content, .. } => {
                out.push_str("[user] ");
                out.push_str(content.as_text().unwrap_or("(multimodal message)"));
            }
            Message::Assistant(a) => {
                out.push_str("[assistant] ");
                let text = a.text();
                if text.is_empty() {
                    for (_, name, args) in a.tool_calls() {
                        out.push_str(&format!(
                            "(called tool {name} with {})",
                            serde_json::Value::Object(args.clone())
                        ));
                    }
                } else {
                    out.push_str(&text);
                }
            }
            Message::ToolResult(r) => {
                out.push_str(&format!("[tool {}] ", r.tool_name));
                let text = r.text();
                // Tool output dominates token counts; a clipped rendering is
                // enough for the summarizer.
                if text.len() > 2_000 {
                    let mut cut = 2_000;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    out.push_str(&text[..cut]);
                    out.push_str(" [...]");
                } else {
                    out.push_str(&text);
                }
            }
            Message::Custom { role, .. } => {
                out.push_str(&format!("[{role}]"));
            }
        }
        out.push('\n');
    }
    out
}

/// Placeholder summary used when the summary model call fails and old
/// messages are dropped without one.
pub const EMERGENCY_SUMMARY: &str =
    "(Earlier conversation history was dropped to fit the context window; \
     no summary is available.)";

// ─── Unit tests ──────────────────────────────────────────────────────────────
