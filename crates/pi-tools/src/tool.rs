// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A single content item in a tool result.  Most tools produce only `Text`;
/// vision-producing tools may mix in `Image` items.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResultPart {
    Text(String),
    Image { data: String, mime: String },
}

/// The result of executing a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub parts: Vec<ToolResultPart>,
    /// Structured payload for front-ends (diff stats, exit codes, ...);
    /// never shown to the model.
    pub details: Option<Value>,
    /// A non-fatal failure: the message is fed back to the model so it can
    /// correct itself.
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            parts: vec![ToolResultPart::Text(content.into())],
            details: None,
            is_error: false,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            parts: vec![ToolResultPart::Text(message.into())],
            details: None,
            is_error: true,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Concatenation of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ToolResultPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Progress callback: tools may report partial output any number of times
/// before completion.  Each call becomes a `tool_execution_update` event.
pub type UpdateFn = Arc<dyn Fn(Value) + Send + Sync>;

/// Trait that every built-in and user-registered tool implements.
///
/// `execute` must observe `cancel` cooperatively; a cancelled token means
/// the turn was aborted and the result will be recorded as an error.
/// Failures are reported through [`ToolResult::err`], not panics.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    /// Display label for front-ends.
    fn label(&self) -> &str {
        self.name()
    }
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> Value;
    async fn execute(
        &self,
        tool_call_id: &str,
        params: Value,
        cancel: CancellationToken,
        on_update: Option<UpdateFn>,
    ) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_result_has_single_text_part() {
        let r = ToolResult::ok("done");
        assert!(!r.is_error);
        assert_eq!(r.text(), "done");
        assert_eq!(r.parts.len(), 1);
    }

    #[test]
    fn err_result_sets_flag() {
        let r = ToolResult::err("failed to read file");
        assert!(r.is_error);
        assert_eq!(r.text(), "failed to read file");
    }

    #[test]
    fn with_details_attaches_payload() {
        let r = ToolResult::ok("x").with_details(json!({ "exitCode": 0 }));
        assert_eq!(r.details.unwrap()["exitCode"], 0);
    }

    #[test]
    fn text_skips_image_parts() {
        let r = ToolResult {
            parts: vec![
                ToolResultPart::Text("caption".into()),
                ToolResultPart::Image {
                    data: "AAAA".into(),
                    mime: "image/png".into(),
                },
            ],
            details: None,
            is_error: false,
        };
        assert_eq!(r.text(), "caption");
    }
}
