// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end agent-loop tests driven by the scripted mock provider.
//!
//! The provider registry is process-wide, so every test that swaps the
//! `mock` api serializes on a shared lock and restores the built-ins when
//! done.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use pi_config::{CreateAgentSessionOptions, RetrySettings, Settings};
use pi_core::{
    AgentEvent, AgentSession, PromptOptions, SKIPPED_RESULT_TEXT,
};
use pi_model::{
    catalog::mock_model, registry, Message, ScriptedProvider, ScriptedTurn, StopReason,
};
use pi_tools::builtin::CalculateTool;
use pi_tools::{Tool, ToolRegistry, ToolResult, UpdateFn};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn serialized() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

fn install_provider(turns: Vec<ScriptedTurn>) -> Arc<ScriptedProvider> {
    let provider = Arc::new(ScriptedProvider::new(turns));
    registry::register(provider.clone(), "test-script");
    provider
}

fn teardown_provider() {
    registry::unregister("test-script");
    registry::reset();
}

async fn make_session(tmp: &tempfile::TempDir, registry_tools: ToolRegistry) -> AgentSession {
    let mut options = CreateAgentSessionOptions::new(
        tmp.path().join("project"),
        tmp.path().join("agent"),
        Settings {
            retry: RetrySettings {
                max_attempts: 3,
                initial_delay_ms: 1,
                backoff_multiplier: 2.0,
                max_delay_ms: 5,
            },
            ..Settings::default()
        },
    );
    options.model = Some(mock_model());
    AgentSession::create(options, Arc::new(registry_tools), vec![])
        .await
        .expect("session should initialize")
}

// ── Scenario: basic prompt ────────────────────────────────────────────────────

#[tokio::test]
async fn basic_prompt_round_trip() {
    let _guard = serialized();
    install_provider(vec![ScriptedTurn::Text("4".into())]);
    let tmp = tempfile::tempdir().unwrap();
    let session = make_session(&tmp, ToolRegistry::new()).await;

    session
        .prompt_and_wait(
            "What is 2+2? Answer with just the number.",
            PromptOptions::default(),
        )
        .await
        .unwrap();

    let messages = session.get_messages();
    assert_eq!(messages.len(), 2);
    match &messages[1] {
        Message::Assistant(a) => {
            assert!(a.text().contains('4'));
            assert_eq!(a.stop_reason, StopReason::Stop);
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert!(!session.agent().is_streaming());
    teardown_provider();
}

// ── Scenario: tool round-trip ─────────────────────────────────────────────────

#[tokio::test]
async fn tool_round_trip_through_calculator() {
    let _guard = serialized();
    install_provider(vec![
        ScriptedTurn::ToolCall {
            id: "tc_calc".into(),
            name: "calculate".into(),
            args: json!({ "expression": "123 * 456" }),
        },
        ScriptedTurn::Text("The result is 56088.".into()),
    ]);
    let tmp = tempfile::tempdir().unwrap();
    let mut tools = ToolRegistry::new();
    tools.register(CalculateTool);
    let session = make_session(&tmp, tools).await;

    session
        .prompt_and_wait(
            "Calculate 123 * 456 using the calculator tool.",
            PromptOptions::default(),
        )
        .await
        .unwrap();

    let messages = session.get_messages();
    // user, assistant(toolCall), toolResult, assistant(text)
    assert_eq!(messages.len(), 4);
    match &messages[1] {
        Message::Assistant(a) => {
            let calls = a.tool_calls();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].1, "calculate");
        }
        other => panic!("unexpected: {other:?}"),
    }
    match &messages[2] {
        Message::ToolResult(r) => {
            assert_eq!(r.tool_call_id, "tc_calc");
            assert!(r.text().contains("56088"));
            assert!(!r.is_error);
        }
        other => panic!("unexpected: {other:?}"),
    }
    match &messages[3] {
        Message::Assistant(a) => assert!(a.text().contains("56088")),
        other => panic!("unexpected: {other:?}"),
    }
    teardown_provider();
}

// ── Event ordering ────────────────────────────────────────────────────────────

#[tokio::test]
async fn event_sequence_matches_turn_grammar() {
    let _guard = serialized();
    install_provider(vec![
        ScriptedTurn::ToolCall {
            id: "tc_1".into(),
            name: "calculate".into(),
            args: json!({ "expression": "1+1" }),
        },
        ScriptedTurn::Text("2".into()),
    ]);
    let tmp = tempfile::tempdir().unwrap();
    let mut tools = ToolRegistry::new();
    tools.register(CalculateTool);
    let session = make_session(&tmp, tools).await;
    let mut sub = session.subscribe();

    session
        .prompt_and_wait("calc", PromptOptions::default())
        .await
        .unwrap();

    let mut names = Vec::new();
    while let Some(envelope) = sub.recv().await {
        let name = envelope.event.type_name().to_string();
        // Updates are variable-length; drop them for the shape check.
        if name != "message_update" && name != "tool_execution_update" {
            names.push(name.clone());
        }
        if name == "agent_end" {
            break;
        }
    }
    assert_eq!(
        names,
        vec![
            "agent_start",
            "turn_start",
            "message_start",
            "message_end",
            "tool_execution_start",
            "tool_execution_end",
            "message_start",
            "message_end",
            "turn_end",
            "turn_start",
            "message_start",
            "message_end",
            "turn_end",
            "agent_end",
        ]
    );
    teardown_provider();
}

// ── Abort during tool execution ───────────────────────────────────────────────

/// Signals when execution starts, then blocks until cancelled.
struct BlockingTool {
    started: tokio::sync::mpsc::UnboundedSender<()>,
}

#[async_trait::async_trait]
impl Tool for BlockingTool {
    fn name(&self) -> &str {
        "blocking"
    }
    fn description(&self) -> &str {
        "blocks until cancelled"
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }
    async fn execute(
        &self,
        _id: &str,
        _params: Value,
        cancel: CancellationToken,
        _on_update: Option<UpdateFn>,
    ) -> ToolResult {
        let _ = self.started.send(());
        cancel.cancelled().await;
        ToolResult::err("tool aborted")
    }
}

#[tokio::test]
async fn abort_during_tools_skips_rest_of_batch() {
    let _guard = serialized();
    install_provider(vec![ScriptedTurn::ToolCalls(vec![
        ("tc_a".into(), "blocking".into(), json!({})),
        ("tc_b".into(), "blocking".into(), json!({})),
    ])]);
    let tmp = tempfile::tempdir().unwrap();
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut tools = ToolRegistry::new();
    tools.register(BlockingTool {
        started: started_tx,
    });
    let session = make_session(&tmp, tools).await;

    let handle = session
        .prompt(
            "run two blocking tools",
            PromptOptions::default(),
        )
        .unwrap();
    // Wait until the first tool is actually executing, then abort.
    started_rx.recv().await.unwrap();
    session.abort();
    handle.await.unwrap();

    let messages = session.get_messages();
    let last = messages.last().unwrap();
    match last {
        Message::Assistant(a) => {
            assert_eq!(a.stop_reason, StopReason::Aborted);
            assert!(a.error_message.is_some());
        }
        other => panic!("expected aborted assistant, got {other:?}"),
    }
    // tc_a got an error result from its own cancellation; tc_b was skipped.
    let results: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            Message::ToolResult(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_error));
    assert_eq!(results[1].text(), SKIPPED_RESULT_TEXT);
    assert!(!session.agent().is_streaming());
    teardown_provider();
}

// ── Steering ──────────────────────────────────────────────────────────────────

/// Signals when execution starts, then waits for the test's go-ahead.
struct GatedTool {
    started: tokio::sync::mpsc::UnboundedSender<()>,
    gate: Arc<tokio::sync::Notify>,
}

#[async_trait::async_trait]
impl Tool for GatedTool {
    fn name(&self) -> &str {
        "gated"
    }
    fn description(&self) -> &str {
        "waits for the test before finishing"
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }
    async fn execute(
        &self,
        _id: &str,
        _params: Value,
        _cancel: CancellationToken,
        _on_update: Option<UpdateFn>,
    ) -> ToolResult {
        let _ = self.started.send(());
        self.gate.notified().await;
        ToolResult::ok("finished")
    }
}

#[tokio::test]
async fn steer_lands_in_history_before_next_turn_and_skips_batch() {
    let _guard = serialized();
    install_provider(vec![
        ScriptedTurn::ToolCalls(vec![
            ("tc_1".into(), "gated".into(), json!({})),
            ("tc_2".into(), "gated".into(), json!({})),
        ]),
        ScriptedTurn::Text("steered answer".into()),
    ]);
    let tmp = tempfile::tempdir().unwrap();
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let gate = Arc::new(tokio::sync::Notify::new());
    let mut tools = ToolRegistry::new();
    tools.register(GatedTool {
        started: started_tx,
        gate: Arc::clone(&gate),
    });
    let session = make_session(&tmp, tools).await;

    let handle = session.prompt("start", PromptOptions::default()).unwrap();
    started_rx.recv().await.unwrap();
    // Steer while the first tool is mid-execution, then let it finish.
    session.steer("actually, stop and do this instead");
    gate.notify_one();
    handle.await.unwrap();

    let messages = session.get_messages();
    let steer_index = messages
        .iter()
        .position(|m| matches!(m, Message::User { content, .. }
            if content.as_text() == Some("actually, stop and do this instead")))
        .expect("steered message must be in history");
    // The second tool call was skipped with the documented marker, and the
    // steered message follows the batch but precedes the next assistant.
    let skipped_index = messages
        .iter()
        .position(|m| matches!(m, Message::ToolResult(r)
            if r.tool_call_id == "tc_2" && r.text() == SKIPPED_RESULT_TEXT))
        .expect("second call must be skipped");
    assert!(steer_index > skipped_index);
    assert_eq!(
        session.get_last_assistant_text().as_deref(),
        Some("steered answer")
    );
    teardown_provider();
}

// ── Auto-retry ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn transient_error_is_retried_then_succeeds() {
    let _guard = serialized();
    install_provider(vec![
        ScriptedTurn::Error("mock error 429: rate limited".into()),
        ScriptedTurn::Text("recovered".into()),
    ]);
    let tmp = tempfile::tempdir().unwrap();
    let session = make_session(&tmp, ToolRegistry::new()).await;
    let mut sub = session.subscribe();

    session
        .prompt_and_wait("hello", PromptOptions::default())
        .await
        .unwrap();

    let mut saw_retry = false;
    while let Some(envelope) = sub.recv().await {
        match envelope.event {
            AgentEvent::Retry { attempt, .. } => {
                assert_eq!(attempt, 1);
                saw_retry = true;
            }
            AgentEvent::AgentEnd => break,
            _ => {}
        }
    }
    assert!(saw_retry, "a retry event must be emitted");

    let messages = session.get_messages();
    assert_eq!(messages.len(), 2, "failed attempt is not recorded");
    assert_eq!(session.get_last_assistant_text().as_deref(), Some("recovered"));
    teardown_provider();
}

/// Collect event-type names until `agent_end`, skipping the
/// variable-length update events.
async fn collect_lifecycle_events(sub: &mut pi_core::EventSubscriber) -> Vec<String> {
    let mut names = Vec::new();
    while let Some(envelope) = sub.recv().await {
        let name = envelope.event.type_name().to_string();
        if name != "message_update" && name != "tool_execution_update" {
            names.push(name.clone());
        }
        if name == "agent_end" {
            break;
        }
    }
    names
}

/// Every `message_end` must close exactly one open `message_start`.
fn assert_message_events_balanced(names: &[String]) {
    let mut open = 0i32;
    for name in names {
        match name.as_str() {
            "message_start" => {
                open += 1;
                assert_eq!(open, 1, "nested message_start in {names:?}");
            }
            "message_end" => {
                assert_eq!(open, 1, "message_end without message_start in {names:?}");
                open -= 1;
            }
            _ => {}
        }
    }
    assert_eq!(open, 0, "dangling message_start in {names:?}");
}

#[tokio::test]
async fn preflight_provider_failure_still_brackets_message_events() {
    let _guard = serialized();
    install_provider(vec![]);
    let tmp = tempfile::tempdir().unwrap();
    let session = make_session(&tmp, ToolRegistry::new()).await;
    // Point the agent at an api no provider serves: the turn fails before
    // any stream exists, and the error message must still arrive as a
    // balanced messageStart → messageEnd pair.
    let mut model = mock_model();
    model.api = "no-such-api".into();
    session.agent().set_model(model);
    let mut sub = session.subscribe();

    session
        .prompt_and_wait("hello", PromptOptions::default())
        .await
        .unwrap();

    let names = collect_lifecycle_events(&mut sub).await;
    assert_eq!(
        names,
        vec![
            "agent_start",
            "turn_start",
            "message_start",
            "message_end",
            "turn_end",
            "agent_end",
        ]
    );
    match session.get_messages().last().unwrap() {
        Message::Assistant(a) => {
            assert_eq!(a.stop_reason, StopReason::Error);
            assert!(a
                .error_message
                .as_deref()
                .unwrap()
                .contains("no provider registered"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    teardown_provider();
}

#[tokio::test]
async fn retry_path_keeps_message_events_balanced() {
    let _guard = serialized();
    install_provider(vec![
        ScriptedTurn::Error("mock error 429: rate limited".into()),
        ScriptedTurn::Error("mock error 503: overloaded".into()),
        ScriptedTurn::Text("recovered".into()),
    ]);
    let tmp = tempfile::tempdir().unwrap();
    let session = make_session(&tmp, ToolRegistry::new()).await;
    let mut sub = session.subscribe();

    session
        .prompt_and_wait("hello", PromptOptions::default())
        .await
        .unwrap();

    let names = collect_lifecycle_events(&mut sub).await;
    assert_message_events_balanced(&names);
    // Two failed attempts retried, one appended assistant: exactly one
    // bracketed pair around the whole exchange.
    assert_eq!(names.iter().filter(|n| *n == "retry").count(), 2);
    assert_eq!(names.iter().filter(|n| *n == "message_start").count(), 1);
    assert_eq!(names.iter().filter(|n| *n == "message_end").count(), 1);
    assert_eq!(session.get_last_assistant_text().as_deref(), Some("recovered"));
    teardown_provider();
}

#[tokio::test]
async fn non_transient_error_surfaces_without_retry() {
    let _guard = serialized();
    install_provider(vec![ScriptedTurn::Error(
        "mock error 400: bad request".into(),
    )]);
    let tmp = tempfile::tempdir().unwrap();
    let session = make_session(&tmp, ToolRegistry::new()).await;

    session
        .prompt_and_wait("hello", PromptOptions::default())
        .await
        .unwrap();

    let messages = session.get_messages();
    match messages.last().unwrap() {
        Message::Assistant(a) => {
            assert_eq!(a.stop_reason, StopReason::Error);
            assert!(a.error_message.as_deref().unwrap().contains("400"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    teardown_provider();
}

// ── Fork and parentage ────────────────────────────────────────────────────────

#[tokio::test]
async fn fork_preserves_old_branch_and_reopens_correctly() {
    let _guard = serialized();
    install_provider(vec![
        ScriptedTurn::Text("reply A".into()),
        ScriptedTurn::Text("reply B".into()),
        ScriptedTurn::Text("reply C".into()),
    ]);
    let tmp = tempfile::tempdir().unwrap();
    let session = make_session(&tmp, ToolRegistry::new()).await;

    session.prompt_and_wait("A", PromptOptions::default()).await.unwrap();
    session.prompt_and_wait("B", PromptOptions::default()).await.unwrap();

    let forkable = session.get_user_messages_for_forking();
    assert_eq!(forkable.len(), 2);
    let entry_a = forkable[0].entry_id.clone();

    let fork = session.fork(&entry_a).unwrap();
    assert_eq!(fork.selected_text.as_deref(), Some("A"));
    assert!(!fork.cancelled);

    session.prompt_and_wait("C", PromptOptions::default()).await.unwrap();

    // In-memory view after the fork: A's exchange plus C's.
    let texts: Vec<String> = session
        .get_messages()
        .iter()
        .map(|m| match m {
            Message::User { content, .. } => content.as_text().unwrap_or("").to_string(),
            Message::Assistant(a) => a.text(),
            other => panic!("unexpected: {other:?}"),
        })
        .collect();
    assert_eq!(texts, vec!["A", "reply A", "C", "reply C"]);

    // Reopen the file: the path walks the new branch; B survives in the
    // file but off-path.
    let path = session.session_file().unwrap();
    drop(session);
    let store = pi_session::SessionStore::open(&path, &tmp.path().join("project")).unwrap();
    let ctx = store.build_session_context();
    let reopened: Vec<String> = ctx
        .messages
        .iter()
        .map(|m| match m {
            Message::User { content, .. } => content.as_text().unwrap_or("").to_string(),
            Message::Assistant(a) => a.text(),
            other => panic!("unexpected: {other:?}"),
        })
        .collect();
    assert_eq!(reopened, vec!["A", "reply A", "C", "reply C"]);
    let file_text = std::fs::read_to_string(&path).unwrap();
    assert!(file_text.contains("reply B"), "fork must not destroy old branch");
    teardown_provider();
}

// ── Compaction ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn compaction_preserves_tail_and_prefixes_summary() {
    let _guard = serialized();
    let mut turns: Vec<ScriptedTurn> = (0..10)
        .map(|i| ScriptedTurn::Text(format!("reply {i}")))
        .collect();
    // The compaction summary call pops the next script.
    turns.push(ScriptedTurn::Text("summary of the early conversation".into()));
    // The prompt after compaction.
    turns.push(ScriptedTurn::Text("post-compaction reply".into()));
    let provider = install_provider(turns);

    let tmp = tempfile::tempdir().unwrap();
    let session = make_session(&tmp, ToolRegistry::new()).await;
    for i in 0..10 {
        session
            .prompt_and_wait(&format!("prompt {i}"), PromptOptions::default())
            .await
            .unwrap();
    }

    let result = session.compact(None).await.unwrap();
    assert_eq!(result.summary, "summary of the early conversation");
    assert!(result.tokens_before > 0);
    assert!(!result.first_kept_entry_id.is_empty());

    session
        .prompt_and_wait("next", PromptOptions::default())
        .await
        .unwrap();

    // The provider-wire input of the post-compaction turn starts with the
    // synthetic summary user message, followed only by the kept tail.
    let ctx = provider.last_context.lock().unwrap().clone().unwrap();
    match &ctx.messages[0] {
        Message::User { content, .. } => {
            assert_eq!(content.as_text(), Some("summary of the early conversation"))
        }
        other => panic!("unexpected: {other:?}"),
    }
    // keep_recent = 8 tail messages + summary + the new prompt.
    assert_eq!(ctx.messages.len(), 10);

    // The store agrees after reopen.
    let path = session.session_file().unwrap();
    drop(session);
    let store = pi_session::SessionStore::open(&path, &tmp.path().join("project")).unwrap();
    let ctx = store.build_session_context();
    match &ctx.messages[0] {
        Message::User { content, .. } => {
            assert_eq!(content.as_text(), Some("summary of the early conversation"))
        }
        other => panic!("unexpected: {other:?}"),
    }
    teardown_provider();
}

// ── Custom bash entries replay as user messages ───────────────────────────────

#[tokio::test]
async fn bash_execution_is_recorded_and_replayed() {
    let _guard = serialized();
    let provider = install_provider(vec![ScriptedTurn::Text("saw it".into())]);
    let tmp = tempfile::tempdir().unwrap();
    let session = make_session(&tmp, ToolRegistry::new()).await;

    let result = session.execute_bash("echo from-bash").await.unwrap();
    assert_eq!(result.exit_code, Some(0));
    assert!(result.output.contains("from-bash"));
    assert!(!result.cancelled);

    session
        .prompt_and_wait("what did that print?", PromptOptions::default())
        .await
        .unwrap();

    let ctx = provider.last_context.lock().unwrap().clone().unwrap();
    let replayed = ctx
        .messages
        .iter()
        .filter_map(|m| match m {
            Message::User { content, .. } => content.as_text().map(str::to_string),
            _ => None,
        })
        .any(|t| t.contains("echo from-bash") && t.contains("from-bash"));
    assert!(replayed, "bash execution must replay as a user message");
    teardown_provider();
}

// ── Busy guard ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn prompt_while_streaming_fails_and_steer_never_does() {
    let _guard = serialized();
    install_provider(vec![ScriptedTurn::Hang]);
    let tmp = tempfile::tempdir().unwrap();
    let session = make_session(&tmp, ToolRegistry::new()).await;

    let handle = session.prompt("first", PromptOptions::default()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(session.prompt("second", PromptOptions::default()).is_err());
    assert!(session.steer("queued instead").is_none());
    assert_eq!(session.get_state().pending_message_count, 1);

    session.abort();
    handle.await.unwrap();
    assert!(!session.agent().is_streaming());
    teardown_provider();
}

// ── get_state shape ───────────────────────────────────────────────────────────

#[tokio::test]
async fn state_view_reports_session_and_model() {
    let _guard = serialized();
    install_provider(vec![]);
    let tmp = tempfile::tempdir().unwrap();
    let session = make_session(&tmp, ToolRegistry::new()).await;
    let state = session.get_state();
    assert_eq!(state.model, "mock/mock-model");
    assert!(!state.is_streaming);
    assert!(state.session_file.is_some());
    assert_eq!(state.message_count, 0);
    let path: PathBuf = state.session_file.unwrap();
    assert!(path.exists());
    teardown_provider();
}
