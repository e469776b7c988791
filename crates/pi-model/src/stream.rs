// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::{AssistantMessage, ContentBlock, StopReason, TokenUsage};

/// A single streamed event from a provider adapter.
#[derive(Debug, Clone)]
pub enum AssistantEvent {
    TextDelta(String),
    ThinkingDelta(String),
    /// A tool-call fragment opened.  `index` identifies the fragment when the
    /// provider interleaves several parallel calls.
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallArgDelta {
        index: usize,
        delta: String,
    },
    ToolCallEnd {
        index: usize,
    },
    Usage(TokenUsage),
    /// Emitted exactly once; after `Done`, no further deltas.
    Done {
        reason: StopReason,
        message: AssistantMessage,
    },
}

/// The consumer side of an assistant stream.
///
/// Two faces: `next()` pulls events for subscribers that render deltas, and
/// `result()` drains the stream and returns the final assembled message —
/// the same message carried by the `Done` event.  Transport errors and
/// cancellation never surface through the iterator; they arrive as
/// `Done { reason: Error | Aborted, .. }`.
pub struct AssistantEventStream {
    rx: mpsc::Receiver<AssistantEvent>,
    done: bool,
}

impl AssistantEventStream {
    pub async fn next(&mut self) -> Option<AssistantEvent> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(ev) => {
                if matches!(ev, AssistantEvent::Done { .. }) {
                    self.done = true;
                }
                Some(ev)
            }
            // The sink was dropped without emitting Done (adapter bug or
            // panicked task).  Materialize the failure in-band so consumers
            // never hang and never see an error through the iterator.
            None => {
                self.done = true;
                Some(AssistantEvent::Done {
                    reason: StopReason::Error,
                    message: orphan_error_message(),
                })
            }
        }
    }

    /// Drain remaining events and return the final assembled message.
    pub async fn result(mut self) -> AssistantMessage {
        loop {
            match self.next().await {
                Some(AssistantEvent::Done { message, .. }) => return message,
                Some(_) => continue,
                None => return orphan_error_message(),
            }
        }
    }
}

fn orphan_error_message() -> AssistantMessage {
    AssistantMessage {
        content: vec![],
        api: String::new(),
        provider: String::new(),
        model: String::new(),
        usage: TokenUsage::default(),
        stop_reason: StopReason::Error,
        error_message: Some("stream closed before completion".into()),
        invalid_tool_call_ids: vec![],
        timestamp: Utc::now(),
    }
}

/// The producer side, held by a provider adapter.
///
/// Every emission both forwards the event to the consumer and feeds the
/// internal accumulator, so the final message handed to [`EventSink::done`]
/// is always consistent with the delta sequence.  `done` consumes the sink,
/// which is what guarantees the exactly-once property.
pub struct EventSink {
    tx: mpsc::Sender<AssistantEvent>,
    acc: MessageAccumulator,
}

impl EventSink {
    /// Create a connected sink/stream pair for one assistant message.
    pub fn channel(api: &str, provider: &str, model: &str) -> (EventSink, AssistantEventStream) {
        let (tx, rx) = mpsc::channel(256);
        (
            EventSink {
                tx,
                acc: MessageAccumulator::new(api, provider, model),
            },
            AssistantEventStream { rx, done: false },
        )
    }

    pub async fn text_delta(&mut self, delta: impl Into<String>) {
        let delta = delta.into();
        if delta.is_empty() {
            return;
        }
        self.acc.text_delta(&delta);
        let _ = self.tx.send(AssistantEvent::TextDelta(delta)).await;
    }

    pub async fn thinking_delta(&mut self, delta: impl Into<String>) {
        let delta = delta.into();
        if delta.is_empty() {
            return;
        }
        self.acc.thinking_delta(&delta);
        let _ = self.tx.send(AssistantEvent::ThinkingDelta(delta)).await;
    }

    /// Attach the provider's signature to the current thinking block.
    pub fn thinking_signature(&mut self, signature: impl Into<String>) {
        self.acc.thinking_signature(signature.into());
    }

    pub fn redacted_thinking(&mut self, data: impl Into<String>) {
        self.acc.redacted_thinking(data.into());
    }

    pub async fn tool_call_start(&mut self, index: usize, id: &str, name: &str) {
        self.acc.tool_call_start(index, id, name);
        let _ = self
            .tx
            .send(AssistantEvent::ToolCallStart {
                index,
                id: id.to_string(),
                name: name.to_string(),
            })
            .await;
    }

    pub async fn tool_call_arg_delta(&mut self, index: usize, delta: &str) {
        self.acc.tool_call_arg_delta(index, delta);
        let _ = self
            .tx
            .send(AssistantEvent::ToolCallArgDelta {
                index,
                delta: delta.to_string(),
            })
            .await;
    }

    pub async fn tool_call_end(&mut self, index: usize) {
        self.acc.tool_call_end(index);
        let _ = self.tx.send(AssistantEvent::ToolCallEnd { index }).await;
    }

    pub async fn usage(&mut self, usage: TokenUsage) {
        self.acc.usage.merge(usage);
        let _ = self.tx.send(AssistantEvent::Usage(usage)).await;
    }

    /// Finish the stream normally with the given stop reason.
    pub async fn done(self, reason: StopReason) {
        self.finish(reason, None).await;
    }

    /// Finish the stream with a transport or provider error.
    pub async fn error(self, message: impl Into<String>) {
        self.finish(StopReason::Error, Some(message.into())).await;
    }

    /// Finish the stream after caller cancellation.
    pub async fn aborted(self) {
        self.finish(StopReason::Aborted, Some("aborted by user".into()))
            .await;
    }

    async fn finish(mut self, reason: StopReason, error_message: Option<String>) {
        let message = self.acc.finish(reason, error_message);
        let _ = self
            .tx
            .send(AssistantEvent::Done { reason, message })
            .await;
    }
}

// ─── Message assembly ─────────────────────────────────────────────────────────

struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
    /// Position of the placeholder block reserved in `content`.
    block_index: usize,
}

/// Assembles streamed deltas into a final [`AssistantMessage`].
struct MessageAccumulator {
    api: String,
    provider: String,
    model: String,
    content: Vec<ContentBlock>,
    pending: HashMap<usize, PendingToolCall>,
    invalid_tool_call_ids: Vec<String>,
    usage: TokenUsage,
}

impl MessageAccumulator {
    fn new(api: &str, provider: &str, model: &str) -> Self {
        Self {
            api: api.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            content: Vec::new(),
            pending: HashMap::new(),
            invalid_tool_call_ids: Vec::new(),
            usage: TokenUsage::default(),
        }
    }

    fn text_delta(&mut self, delta: &str) {
        if let Some(ContentBlock::Text { text }) = self.content.last_mut() {
            text.push_str(delta);
        } else {
            self.content.push(ContentBlock::text(delta));
        }
    }

    fn thinking_delta(&mut self, delta: &str) {
        if let Some(ContentBlock::Thinking { thinking, .. }) = self.content.last_mut() {
            thinking.push_str(delta);
        } else {
            self.content.push(ContentBlock::Thinking {
                thinking: delta.to_string(),
                signature: None,
            });
        }
    }

    fn thinking_signature(&mut self, sig: String) {
        if let Some(ContentBlock::Thinking { signature, .. }) = self
            .content
            .iter_mut()
            .rev()
            .find(|b| matches!(b, ContentBlock::Thinking { .. }))
        {
            *signature = Some(sig);
        }
    }

    fn redacted_thinking(&mut self, data: String) {
        self.content.push(ContentBlock::RedactedThinking { data });
    }

    fn tool_call_start(&mut self, index: usize, id: &str, name: &str) {
        // Reserve the block position now so interleaved text keeps its
        // relative order in the final content list.
        let block_index = self.content.len();
        self.content.push(ContentBlock::tool_call(id, name, Map::new()));
        self.pending.insert(
            index,
            PendingToolCall {
                id: id.to_string(),
                name: name.to_string(),
                args_buf: String::new(),
                block_index,
            },
        );
    }

    fn tool_call_arg_delta(&mut self, index: usize, delta: &str) {
        if let Some(ptc) = self.pending.get_mut(&index) {
            ptc.args_buf.push_str(delta);
        }
    }

    fn tool_call_end(&mut self, index: usize) {
        let Some(ptc) = self.pending.remove(&index) else {
            return;
        };
        let args = if ptc.args_buf.trim().is_empty() {
            Some(Map::new())
        } else {
            match serde_json::from_str::<Value>(&ptc.args_buf) {
                Ok(Value::Object(map)) => Some(map),
                Ok(other) => {
                    warn!(
                        tool_call_id = %ptc.id,
                        "tool-call arguments are not a JSON object: {other}"
                    );
                    None
                }
                Err(_) => match attempt_json_repair(&ptc.args_buf) {
                    Ok(Value::Object(map)) => {
                        warn!(tool_call_id = %ptc.id, "repaired invalid JSON tool arguments");
                        Some(map)
                    }
                    _ => None,
                },
            }
        };
        match args {
            Some(map) => {
                if let Some(ContentBlock::ToolCall { arguments, .. }) =
                    self.content.get_mut(ptc.block_index)
                {
                    *arguments = map;
                }
            }
            None => {
                warn!(
                    tool_call_id = %ptc.id,
                    tool_name = %ptc.name,
                    "tool call has unparseable arguments; will synthesize an error result"
                );
                self.invalid_tool_call_ids.push(ptc.id);
            }
        }
    }

    fn finish(&mut self, reason: StopReason, error_message: Option<String>) -> AssistantMessage {
        // Close any fragments the provider never terminated (truncated or
        // aborted streams).
        let open: Vec<usize> = self.pending.keys().copied().collect();
        for index in open {
            self.tool_call_end(index);
        }
        AssistantMessage {
            content: std::mem::take(&mut self.content),
            api: self.api.clone(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            usage: self.usage,
            stop_reason: reason,
            error_message,
            invalid_tool_call_ids: std::mem::take(&mut self.invalid_tool_call_ids),
            timestamp: Utc::now(),
        }
    }
}

// ─── JSON repair ─────────────────────────────────────────────────────────────

/// Attempt to repair common JSON syntax errors in streamed tool arguments:
/// invalid escape sequences inside string values and truncated objects.
pub(crate) fn attempt_json_repair(json_str: &str) -> anyhow::Result<Value> {
    let fixed = fix_invalid_json_escapes(json_str);
    if let Ok(v) = serde_json::from_str::<Value>(&fixed) {
        return Ok(v);
    }

    // Truncated stream: close an unterminated string and the object.
    if !fixed.trim_end().ends_with('}') {
        let mut completed = fixed.clone();
        let quote_count = fixed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        if !completed.trim_end().ends_with('}') {
            completed.push('}');
        }
        if let Ok(v) = serde_json::from_str::<Value>(&completed) {
            return Ok(v);
        }
    }

    anyhow::bail!("JSON repair failed: all repair strategies exhausted")
}

/// Walk a JSON string and escape any invalid escape sequences inside string
/// values.  Valid JSON escapes are `"`, `\`, `/`, `b`, `f`, `n`, `r`, `t`,
/// `u`; anything else becomes `\\X` so serde_json can parse it.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (EventSink, AssistantEventStream) {
        EventSink::channel("mock", "mock", "mock-model")
    }

    #[tokio::test]
    async fn result_returns_same_message_as_done_event() {
        let (mut s, stream) = sink();
        s.text_delta("hello").await;
        s.done(StopReason::Stop).await;

        let msg = stream.result().await;
        assert_eq!(msg.stop_reason, StopReason::Stop);
        assert_eq!(msg.text(), "hello");
    }

    #[tokio::test]
    async fn done_is_last_event_and_iteration_stops_after_it() {
        let (mut s, mut stream) = sink();
        s.text_delta("x").await;
        s.done(StopReason::Stop).await;

        let mut saw_done = false;
        while let Some(ev) = stream.next().await {
            assert!(!saw_done, "events after Done");
            if matches!(ev, AssistantEvent::Done { .. }) {
                saw_done = true;
            }
        }
        assert!(saw_done);
    }

    #[tokio::test]
    async fn dropped_sink_yields_error_done_not_hang() {
        let (s, mut stream) = sink();
        drop(s);
        match stream.next().await {
            Some(AssistantEvent::Done { reason, message }) => {
                assert_eq!(reason, StopReason::Error);
                assert!(message.error_message.is_some());
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn text_deltas_coalesce_into_one_block() {
        let (mut s, stream) = sink();
        s.text_delta("foo").await;
        s.text_delta("bar").await;
        s.done(StopReason::Stop).await;
        let msg = stream.result().await;
        assert_eq!(msg.content.len(), 1);
        assert_eq!(msg.text(), "foobar");
    }

    #[tokio::test]
    async fn tool_call_arguments_assemble_across_deltas() {
        let (mut s, stream) = sink();
        s.tool_call_start(0, "tc_1", "calculate").await;
        s.tool_call_arg_delta(0, "{\"expres").await;
        s.tool_call_arg_delta(0, "sion\":\"1+1\"}").await;
        s.tool_call_end(0).await;
        s.done(StopReason::ToolUse).await;

        let msg = stream.result().await;
        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "tc_1");
        assert_eq!(calls[0].2["expression"], "1+1");
    }

    #[tokio::test]
    async fn interleaved_parallel_tool_calls_keep_indices_separate() {
        let (mut s, stream) = sink();
        s.tool_call_start(0, "tc_a", "read").await;
        s.tool_call_start(1, "tc_b", "grep").await;
        s.tool_call_arg_delta(0, "{\"path\":\"a\"}").await;
        s.tool_call_arg_delta(1, "{\"pattern\":\"b\"}").await;
        s.tool_call_end(1).await;
        s.tool_call_end(0).await;
        s.done(StopReason::ToolUse).await;

        let msg = stream.result().await;
        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 2);
        // Emission order follows start order, not end order.
        assert_eq!(calls[0].0, "tc_a");
        assert_eq!(calls[1].0, "tc_b");
        assert_eq!(calls[0].2["path"], "a");
        assert_eq!(calls[1].2["pattern"], "b");
    }

    #[tokio::test]
    async fn malformed_arguments_are_flagged_not_executed() {
        let (mut s, stream) = sink();
        s.tool_call_start(0, "tc_bad", "calculate").await;
        s.tool_call_arg_delta(0, "not json at all {{{").await;
        s.tool_call_end(0).await;
        s.done(StopReason::ToolUse).await;

        let msg = stream.result().await;
        assert_eq!(msg.invalid_tool_call_ids, vec!["tc_bad".to_string()]);
    }

    #[tokio::test]
    async fn truncated_arguments_are_repaired() {
        let (mut s, stream) = sink();
        s.tool_call_start(0, "tc_1", "write").await;
        s.tool_call_arg_delta(0, "{\"path\":\"/tmp/f").await;
        // No end event: stream truncated by max-tokens.
        s.done(StopReason::MaxTokens).await;

        let msg = stream.result().await;
        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2["path"], "/tmp/f");
    }

    #[tokio::test]
    async fn thinking_signature_lands_on_thinking_block() {
        let (mut s, stream) = sink();
        s.thinking_delta("reasoning...").await;
        s.thinking_signature("sig-1");
        s.text_delta("answer").await;
        s.done(StopReason::Stop).await;

        let msg = stream.result().await;
        match &msg.content[0] {
            ContentBlock::Thinking {
                thinking,
                signature,
            } => {
                assert_eq!(thinking, "reasoning...");
                assert_eq!(signature.as_deref(), Some("sig-1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn aborted_sink_sets_reason_and_error_message() {
        let (mut s, stream) = sink();
        s.text_delta("partial").await;
        s.aborted().await;
        let msg = stream.result().await;
        assert_eq!(msg.stop_reason, StopReason::Aborted);
        assert!(msg.error_message.is_some());
        assert_eq!(msg.text(), "partial");
    }

    #[tokio::test]
    async fn usage_events_merge_into_final_message() {
        let (mut s, stream) = sink();
        s.usage(TokenUsage {
            input: 100,
            output: 0,
            cache_read: 10,
            cache_write: 0,
        })
        .await;
        s.usage(TokenUsage {
            input: 0,
            output: 20,
            cache_read: 0,
            cache_write: 0,
        })
        .await;
        s.done(StopReason::Stop).await;
        let msg = stream.result().await;
        assert_eq!(msg.usage.input, 100);
        assert_eq!(msg.usage.output, 20);
        assert_eq!(msg.usage.cache_read, 10);
    }

    // ── JSON repair ───────────────────────────────────────────────────────────

    #[test]
    fn repair_fixes_invalid_escape() {
        let v = attempt_json_repair(r#"{"path":"C:\projects\data"}"#).unwrap();
        assert_eq!(v["path"], "C:\\projects\\data");
    }

    #[test]
    fn repair_closes_truncated_object() {
        let v = attempt_json_repair(r#"{"command":"ls -la"#).unwrap();
        assert_eq!(v["command"], "ls -la");
    }

    #[test]
    fn repair_gives_up_on_garbage() {
        assert!(attempt_json_repair("<<<not json>>>").is_err());
    }
}
