// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent loop: a turn-driven state machine that streams assistant
//! messages from the active provider, executes requested tools under
//! cancellation, and re-enters with the results.
//!
//! All mutations to agent state go through one `std::sync::Mutex` with
//! short critical sections; the lock is never held across an `await`.  The
//! loop suspends only on provider stream events, tool futures, and retry
//! delays.  A turn never propagates an error: every failure becomes either
//! an error assistant message or an error tool result.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use pi_config::{CompactionSettings, QueueMode, RetrySettings, Settings};
use pi_model::{
    is_context_overflow, registry, sanitize::strip_images_if_unsupported,
    transform::{normalize_tool_call_id, transform},
    AssistantEvent, AssistantMessage, Message, Model, ProviderContext, StopReason,
    StreamOptions, ThinkingLevel, TokenUsage, ToolSchema,
};
use pi_tools::Tool;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::bus::EventBus;
use crate::compact::{
    compaction_prompt, compaction_split, CompactResult, EMERGENCY_SUMMARY,
};
use crate::events::{AgentEvent, MessageDelta};
use crate::executor::{run_tool_call, skipped_result};
use crate::hooks::HookRunner;
use crate::retry::{backoff_delay, is_transient_error};

/// Tokens reserved on top of the estimate when deciding whether to compact.
const COMPACTION_SAFETY_MARGIN: usize = 1_024;

/// Loop-relevant settings, adjustable at runtime through the façade.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub retry: RetrySettings,
    pub compaction: CompactionSettings,
    pub steering_mode: QueueMode,
    pub follow_up_mode: QueueMode,
    pub auto_compaction: bool,
    pub auto_retry: bool,
}

impl From<&Settings> for AgentConfig {
    fn from(s: &Settings) -> Self {
        Self {
            retry: s.retry.clone(),
            compaction: s.compaction.clone(),
            steering_mode: s.steering_mode,
            follow_up_mode: s.follow_up_mode,
            auto_compaction: s.auto_compaction,
            auto_retry: s.auto_retry,
        }
    }
}

/// Persistence callback: every appended message and compaction record goes
/// through here so the session log is written eagerly.
pub trait EntrySink: Send + Sync {
    /// Returns the id of the entry the message was stored under.
    fn append_message(&self, message: &Message) -> Option<String>;
    fn record_compaction(&self, result: &CompactResult);
}

/// Read-only snapshot of the agent's state.
#[derive(Clone)]
pub struct AgentSnapshot {
    pub system_prompt: Option<String>,
    pub model: Model,
    pub thinking_level: ThinkingLevel,
    pub messages: Vec<Message>,
    pub is_streaming: bool,
    pub pending_tool_calls: Vec<String>,
    pub error: Option<String>,
}

struct State {
    system_prompt: Option<String>,
    model: Model,
    thinking_level: ThinkingLevel,
    tools: Vec<Arc<dyn Tool>>,
    messages: Vec<Message>,
    /// Session-entry id per message, parallel to `messages`.  `None` for
    /// messages that were never persisted (ephemeral or synthetic).
    entry_ids: Vec<Option<String>>,
    pending_tool_calls: HashSet<String>,
    error: Option<String>,
    usage_total: TokenUsage,
}

#[derive(Default)]
struct Queues {
    steering: VecDeque<String>,
    follow_up: VecDeque<String>,
}

struct Inner {
    state: Mutex<State>,
    queues: Mutex<Queues>,
    turn_cancel: Mutex<Option<CancellationToken>>,
    retry_cancel: Mutex<Option<CancellationToken>>,
    streaming: AtomicBool,
    forced_compaction: AtomicBool,
    config: Mutex<AgentConfig>,
    bus: EventBus,
    sink: Mutex<Option<Arc<dyn EntrySink>>>,
    hooks: Mutex<Option<Arc<HookRunner>>>,
    session_id: Mutex<String>,
}

/// Cheap-to-clone handle; all methods take `&self`.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<Inner>,
}

impl Agent {
    pub fn new(model: Model, thinking_level: ThinkingLevel, bus: EventBus) -> Self {
        let session_id = bus.session_id();
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    system_prompt: None,
                    model,
                    thinking_level,
                    tools: Vec::new(),
                    messages: Vec::new(),
                    entry_ids: Vec::new(),
                    pending_tool_calls: HashSet::new(),
                    error: None,
                    usage_total: TokenUsage::default(),
                }),
                queues: Mutex::new(Queues::default()),
                turn_cancel: Mutex::new(None),
                retry_cancel: Mutex::new(None),
                streaming: AtomicBool::new(false),
                forced_compaction: AtomicBool::new(false),
                config: Mutex::new(AgentConfig::from(&Settings::default())),
                bus,
                sink: Mutex::new(None),
                hooks: Mutex::new(None),
                session_id: Mutex::new(session_id),
            }),
        }
    }

    // ── Wiring ────────────────────────────────────────────────────────────────

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn set_sink(&self, sink: Option<Arc<dyn EntrySink>>) {
        *self.inner.sink.lock().unwrap() = sink;
    }

    pub fn set_hooks(&self, hooks: Option<Arc<HookRunner>>) {
        *self.inner.hooks.lock().unwrap() = hooks;
    }

    pub fn set_session_id(&self, session_id: impl Into<String>) {
        *self.inner.session_id.lock().unwrap() = session_id.into();
    }

    pub fn configure(&self, config: AgentConfig) {
        *self.inner.config.lock().unwrap() = config;
    }

    pub fn update_config(&self, f: impl FnOnce(&mut AgentConfig)) {
        f(&mut self.inner.config.lock().unwrap());
    }

    pub fn config(&self) -> AgentConfig {
        self.inner.config.lock().unwrap().clone()
    }

    // ── State accessors and synchronous mutations ─────────────────────────────

    pub fn snapshot(&self) -> AgentSnapshot {
        let state = self.inner.state.lock().unwrap();
        AgentSnapshot {
            system_prompt: state.system_prompt.clone(),
            model: state.model.clone(),
            thinking_level: state.thinking_level,
            messages: state.messages.clone(),
            is_streaming: self.is_streaming(),
            pending_tool_calls: state.pending_tool_calls.iter().cloned().collect(),
            error: state.error.clone(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::SeqCst)
    }

    pub fn model(&self) -> Model {
        self.inner.state.lock().unwrap().model.clone()
    }

    pub fn thinking_level(&self) -> ThinkingLevel {
        self.inner.state.lock().unwrap().thinking_level
    }

    pub fn usage_total(&self) -> TokenUsage {
        self.inner.state.lock().unwrap().usage_total
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().unwrap().messages.clone()
    }

    pub fn last_assistant_text(&self) -> Option<String> {
        let state = self.inner.state.lock().unwrap();
        state.messages.iter().rev().find_map(|m| match m {
            Message::Assistant(a) => {
                let text = a.text();
                (!text.is_empty()).then_some(text)
            }
            _ => None,
        })
    }

    pub fn set_system_prompt(&self, prompt: Option<String>) {
        self.inner.state.lock().unwrap().system_prompt = prompt;
    }

    pub fn set_model(&self, model: Model) {
        self.inner.state.lock().unwrap().model = model;
    }

    pub fn set_thinking_level(&self, level: ThinkingLevel) {
        self.inner.state.lock().unwrap().thinking_level = level;
    }

    pub fn set_tools(&self, tools: Vec<Arc<dyn Tool>>) {
        self.inner.state.lock().unwrap().tools = tools;
    }

    /// Replace the in-memory history, e.g. after resume or session switch.
    /// `entry_ids` carries the session-entry id per message where known.
    pub fn replace_messages(&self, messages: Vec<Message>, entry_ids: Vec<Option<String>>) {
        let mut state = self.inner.state.lock().unwrap();
        state.entry_ids = if entry_ids.len() == messages.len() {
            entry_ids
        } else {
            vec![None; messages.len()]
        };
        state.messages = messages;
        state.pending_tool_calls.clear();
        state.error = None;
    }

    pub fn clear_messages(&self) {
        self.replace_messages(Vec::new(), Vec::new());
    }

    /// Append a message to history, persisting it through the sink.
    pub fn append_message(&self, message: Message) {
        // Persist outside the state lock; the sink takes its own locks.
        let entry_id = {
            let sink = self.inner.sink.lock().unwrap().clone();
            sink.and_then(|s| s.append_message(&message))
        };
        let mut state = self.inner.state.lock().unwrap();
        if let Message::ToolResult(r) = &message {
            state.pending_tool_calls.remove(&r.tool_call_id);
        }
        if let Message::Assistant(a) = &message {
            for (id, _, _) in a.tool_calls() {
                state.pending_tool_calls.insert(id.to_string());
            }
            state.usage_total.input += a.usage.input;
            state.usage_total.output += a.usage.output;
            state.usage_total.cache_read += a.usage.cache_read;
            state.usage_total.cache_write += a.usage.cache_write;
        }
        state.messages.push(message);
        state.entry_ids.push(entry_id);
    }

    // ── Queued user messages ──────────────────────────────────────────────────

    /// Enqueue a steering message; never fails.  Drained between tool
    /// batches and at turn starts.
    pub fn steer(&self, text: impl Into<String>) {
        self.inner
            .queues
            .lock()
            .unwrap()
            .steering
            .push_back(text.into());
    }

    /// Enqueue a follow-up with after-current-turn semantics.
    pub fn follow_up(&self, text: impl Into<String>) {
        self.inner
            .queues
            .lock()
            .unwrap()
            .follow_up
            .push_back(text.into());
    }

    pub fn pending_message_count(&self) -> usize {
        let queues = self.inner.queues.lock().unwrap();
        queues.steering.len() + queues.follow_up.len()
    }

    /// True when a queued message should interrupt the current tool batch.
    fn steering_pending(&self) -> bool {
        let queues = self.inner.queues.lock().unwrap();
        let config = self.inner.config.lock().unwrap();
        (!queues.steering.is_empty() && config.steering_mode == QueueMode::Interrupt)
            || (!queues.follow_up.is_empty() && config.follow_up_mode == QueueMode::Interrupt)
    }

    /// Drain queues at a turn boundary.  Interrupt-mode queues drain at
    /// every boundary; queue-mode queues only once the previous assistant
    /// stopped naturally.
    fn drain_queues(&self, last_stop: Option<StopReason>) {
        let natural = matches!(
            last_stop,
            None | Some(StopReason::Stop) | Some(StopReason::MaxTokens)
        );
        let drained: Vec<String> = {
            let mut queues = self.inner.queues.lock().unwrap();
            let config = self.inner.config.lock().unwrap();
            let mut drained = Vec::new();
            if config.steering_mode == QueueMode::Interrupt || natural {
                drained.extend(queues.steering.drain(..));
            }
            if config.follow_up_mode == QueueMode::Interrupt || natural {
                drained.extend(queues.follow_up.drain(..));
            }
            drained
        };
        for text in drained {
            self.append_message(Message::user(text));
        }
    }

    fn has_drainable_queued(&self, last_stop: Option<StopReason>) -> bool {
        let natural = matches!(
            last_stop,
            None | Some(StopReason::Stop) | Some(StopReason::MaxTokens)
        );
        let queues = self.inner.queues.lock().unwrap();
        let config = self.inner.config.lock().unwrap();
        (!queues.steering.is_empty()
            && (config.steering_mode == QueueMode::Interrupt || natural))
            || (!queues.follow_up.is_empty()
                && (config.follow_up_mode == QueueMode::Interrupt || natural))
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    /// Cancel the current provider stream, all running tools, and any
    /// pending retry.  The resulting assistant message stops with
    /// `Aborted`.
    pub fn abort(&self) {
        if let Some(cancel) = self.inner.turn_cancel.lock().unwrap().as_ref() {
            cancel.cancel();
        }
        self.abort_retry();
    }

    /// Cancel only a pending retry delay.
    pub fn abort_retry(&self) {
        if let Some(cancel) = self.inner.retry_cancel.lock().unwrap().as_ref() {
            cancel.cancel();
        }
    }

    // ── Public operations ─────────────────────────────────────────────────────

    /// Append a user message and run the loop until idle.  Fails when a
    /// turn is already running.
    pub async fn prompt(&self, text: impl Into<String>) -> anyhow::Result<()> {
        self.prompt_message(Message::user(text.into())).await
    }

    pub async fn prompt_message(&self, message: Message) -> anyhow::Result<()> {
        self.begin()?;
        self.append_message(message);
        self.run().await;
        Ok(())
    }

    /// Re-enter the loop without appending, e.g. after an abort.  Fails
    /// when streaming or when there is nothing to continue from.
    pub async fn continue_turn(&self) -> anyhow::Result<()> {
        {
            let state = self.inner.state.lock().unwrap();
            match state.messages.last() {
                None => anyhow::bail!("nothing to continue: history is empty"),
                Some(Message::Assistant(a)) if a.stop_reason != StopReason::Aborted => {
                    anyhow::bail!("nothing to continue: last message is an assistant reply")
                }
                _ => {}
            }
        }
        self.begin()?;
        self.run().await;
        Ok(())
    }

    fn begin(&self) -> anyhow::Result<()> {
        if self
            .inner
            .streaming
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            anyhow::bail!("agent is busy: a turn is already in progress");
        }
        Ok(())
    }

    // ── The loop ─────────────────────────────────────────────────────────────

    async fn run(&self) {
        let cancel = CancellationToken::new();
        *self.inner.turn_cancel.lock().unwrap() = Some(cancel.clone());
        {
            let mut state = self.inner.state.lock().unwrap();
            state.error = None;
        }
        self.inner.bus.emit(AgentEvent::AgentStart);

        let mut last_stop: Option<StopReason> = None;
        loop {
            self.drain_queues(last_stop);
            self.maybe_compact().await;
            self.inner.bus.emit(AgentEvent::TurnStart);

            // Exactly one messageStart/messageEnd pair brackets each
            // appended assistant message, no matter how many retry
            // attempts (or pre-flight failures) happen in between.
            let shell = message_shell(&self.inner.state.lock().unwrap().model);
            self.inner.bus.emit(AgentEvent::MessageStart {
                message: Message::Assistant(shell),
            });

            let assistant = self.stream_with_retry(&cancel).await;
            self.append_message(Message::Assistant(assistant.clone()));
            self.inner
                .bus
                .emit(AgentEvent::MessageEnd {
                    message: Message::Assistant(assistant.clone()),
                });

            match assistant.stop_reason {
                StopReason::Aborted => {
                    self.inner.bus.emit(AgentEvent::TurnEnd);
                    break;
                }
                StopReason::Error => {
                    if is_context_overflow(&assistant) {
                        self.inner.forced_compaction.store(true, Ordering::SeqCst);
                    }
                    self.inner.state.lock().unwrap().error =
                        assistant.error_message.clone();
                    self.inner.bus.emit(AgentEvent::TurnEnd);
                    break;
                }
                StopReason::Stop | StopReason::MaxTokens => {
                    self.inner.bus.emit(AgentEvent::TurnEnd);
                    last_stop = Some(StopReason::Stop);
                    if self.has_drainable_queued(last_stop) {
                        continue;
                    }
                    break;
                }
                StopReason::ToolUse => {
                    let aborted = self.execute_tool_batch(&assistant, &cancel).await;
                    if aborted {
                        let synthetic = aborted_assistant(&assistant);
                        self.append_message(Message::Assistant(synthetic.clone()));
                        self.inner.bus.emit(AgentEvent::MessageStart {
                            message: Message::Assistant(synthetic.clone()),
                        });
                        self.inner.bus.emit(AgentEvent::MessageEnd {
                            message: Message::Assistant(synthetic),
                        });
                        self.inner.bus.emit(AgentEvent::TurnEnd);
                        break;
                    }
                    self.inner.bus.emit(AgentEvent::TurnEnd);
                    last_stop = Some(StopReason::ToolUse);
                }
            }
        }

        *self.inner.turn_cancel.lock().unwrap() = None;
        *self.inner.retry_cancel.lock().unwrap() = None;
        self.inner.streaming.store(false, Ordering::SeqCst);
        self.inner.bus.emit(AgentEvent::AgentEnd);
    }

    async fn stream_with_retry(&self, cancel: &CancellationToken) -> AssistantMessage {
        let mut attempt = 0u32;
        loop {
            let message = self.stream_once(cancel).await;
            if message.stop_reason != StopReason::Error || cancel.is_cancelled() {
                return message;
            }
            let (auto_retry, retry) = {
                let config = self.inner.config.lock().unwrap();
                (config.auto_retry, config.retry.clone())
            };
            let error = message.error_message.clone().unwrap_or_default();
            if !auto_retry || attempt + 1 >= retry.max_attempts || !is_transient_error(&error) {
                return message;
            }
            attempt += 1;
            let delay = backoff_delay(&retry, attempt);
            self.inner.bus.emit(AgentEvent::Retry {
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: error.clone(),
            });
            let retry_cancel = CancellationToken::new();
            *self.inner.retry_cancel.lock().unwrap() = Some(retry_cancel.clone());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = retry_cancel.cancelled() => return message,
                _ = cancel.cancelled() => return message,
            }
        }
    }

    /// One provider call.  Never returns an error: stream failures arrive
    /// in-band as `Done(Error | Aborted)`, and pre-flight failures (no
    /// provider, missing credentials) are materialized here.
    async fn stream_once(&self, cancel: &CancellationToken) -> AssistantMessage {
        let (model, thinking_level, system_prompt, messages, tools) = {
            let state = self.inner.state.lock().unwrap();
            (
                state.model.clone(),
                state.thinking_level,
                state.system_prompt.clone(),
                state.messages.clone(),
                state.tools.clone(),
            )
        };
        let session_id = self.inner.session_id.lock().unwrap().clone();
        let hooks = self.inner.hooks.lock().unwrap().clone();

        let messages = match &hooks {
            Some(h) => h.context(messages).await,
            None => messages,
        };
        let transformed = transform(
            &messages,
            &model,
            Some(&normalize_tool_call_id),
            Some(&default_custom_converter),
        );
        let transformed = strip_images_if_unsupported(transformed, &model);

        let schemas: Vec<ToolSchema> = tools
            .iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();

        let Some(provider) = registry::get(&model.api) else {
            return error_assistant(&model, format!("no provider registered for api {}", model.api));
        };
        let context = ProviderContext {
            system_prompt,
            messages: transformed,
            tools: schemas,
        };
        let options = StreamOptions {
            api_key: None,
            base_url: None,
            session_id: Some(session_id),
            thinking_level,
            max_tokens: None,
            cancel: cancel.child_token(),
        };

        let mut stream = match provider.stream(&model, context, options).await {
            Ok(s) => s,
            Err(e) => return error_assistant(&model, e.to_string()),
        };

        // index → tool-call id, for labelling argument deltas.
        let mut call_ids: HashMap<usize, String> = HashMap::new();
        loop {
            match stream.next().await {
                Some(AssistantEvent::TextDelta(text)) => {
                    self.inner.bus.emit(AgentEvent::MessageUpdate {
                        delta: MessageDelta::Text { text },
                    });
                }
                Some(AssistantEvent::ThinkingDelta(thinking)) => {
                    self.inner.bus.emit(AgentEvent::MessageUpdate {
                        delta: MessageDelta::Thinking { thinking },
                    });
                }
                Some(AssistantEvent::ToolCallStart { index, id, .. }) => {
                    call_ids.insert(index, id);
                }
                Some(AssistantEvent::ToolCallArgDelta { index, delta }) => {
                    let tool_call_id = call_ids.get(&index).cloned().unwrap_or_default();
                    self.inner.bus.emit(AgentEvent::MessageUpdate {
                        delta: MessageDelta::ToolCallArgs {
                            tool_call_id,
                            args: delta,
                        },
                    });
                }
                Some(AssistantEvent::ToolCallEnd { .. }) | Some(AssistantEvent::Usage(_)) => {}
                Some(AssistantEvent::Done { message, .. }) => return message,
                None => return error_assistant(&model, "stream ended without completion"),
            }
        }
    }

    /// Run the tool calls of one assistant message sequentially, in
    /// emission order.  Returns `true` when the batch was aborted.
    async fn execute_tool_batch(
        &self,
        assistant: &AssistantMessage,
        cancel: &CancellationToken,
    ) -> bool {
        let calls: Vec<(String, String, serde_json::Map<String, Value>)> = assistant
            .tool_calls()
            .into_iter()
            .map(|(id, name, args)| (id.to_string(), name.to_string(), args.clone()))
            .collect();
        let tools: HashMap<String, Arc<dyn Tool>> = {
            let state = self.inner.state.lock().unwrap();
            state
                .tools
                .iter()
                .map(|t| (t.name().to_string(), Arc::clone(t)))
                .collect()
        };
        let hooks = self.inner.hooks.lock().unwrap().clone();

        let mut results = Vec::with_capacity(calls.len());
        for (id, name, args) in calls {
            // A queued user message or an abort makes the rest of the batch
            // moot; the model sees explicit skip markers instead.
            if cancel.is_cancelled() || self.steering_pending() {
                results.push(skipped_result(&id, &name));
                continue;
            }
            let result = run_tool_call(
                tools.get(&name).cloned(),
                hooks.clone(),
                &self.inner.bus,
                cancel,
                &id,
                &name,
                args,
                assistant.invalid_tool_call_ids.contains(&id),
            )
            .await;
            results.push(result);
        }

        for result in results {
            let message = Message::ToolResult(result);
            self.append_message(message.clone());
            self.inner.bus.emit(AgentEvent::MessageStart {
                message: message.clone(),
            });
            self.inner.bus.emit(AgentEvent::MessageEnd { message });
        }
        cancel.is_cancelled()
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    /// Manually compact the session.  Fails while a turn is streaming.
    pub async fn compact(
        &self,
        custom_instructions: Option<String>,
    ) -> anyhow::Result<CompactResult> {
        if self.is_streaming() {
            anyhow::bail!("cannot compact while a turn is in progress");
        }
        self.do_compact(custom_instructions.as_deref(), false)
            .await
            .ok_or_else(|| anyhow::anyhow!("history is too short to compact"))
    }

    /// Pre-turn check: compact when the predicted input exceeds the
    /// threshold share of the context window, or unconditionally after a
    /// context-overflow error.
    async fn maybe_compact(&self) {
        let forced = self.inner.forced_compaction.swap(false, Ordering::SeqCst);
        let (auto, threshold) = {
            let config = self.inner.config.lock().unwrap();
            (config.auto_compaction, config.compaction.threshold)
        };
        if !forced {
            if !auto {
                return;
            }
            let (estimate, window) = {
                let state = self.inner.state.lock().unwrap();
                (estimate_tokens(&state), state.model.context_window as usize)
            };
            if estimate + COMPACTION_SAFETY_MARGIN < (window as f32 * threshold) as usize {
                return;
            }
        }
        self.do_compact(None, forced).await;
    }

    async fn do_compact(
        &self,
        custom_instructions: Option<&str>,
        forced: bool,
    ) -> Option<CompactResult> {
        let (messages, entry_ids, model, keep_recent, tokens_before) = {
            let state = self.inner.state.lock().unwrap();
            let config = self.inner.config.lock().unwrap();
            (
                state.messages.clone(),
                state.entry_ids.clone(),
                state.model.clone(),
                config.compaction.keep_recent,
                estimate_tokens(&state) as u64,
            )
        };
        let split = compaction_split(&messages, keep_recent)?;

        let summary = match registry::get(&model.api) {
            Some(provider) => {
                let prompt = compaction_prompt(&messages[..split], custom_instructions);
                match provider.stream_simple(&model, &prompt).await {
                    Ok(stream) => {
                        let reply = stream.result().await;
                        let text = reply.text();
                        if reply.stop_reason == StopReason::Error || text.trim().is_empty() {
                            warn!(
                                error = ?reply.error_message,
                                "compaction summary call failed; dropping old history"
                            );
                            EMERGENCY_SUMMARY.to_string()
                        } else {
                            text
                        }
                    }
                    Err(e) => {
                        warn!("compaction summary call failed: {e}");
                        EMERGENCY_SUMMARY.to_string()
                    }
                }
            }
            None => EMERGENCY_SUMMARY.to_string(),
        };

        let first_kept_entry_id = entry_ids[split..]
            .iter()
            .flatten()
            .next()
            .cloned()
            .unwrap_or_default();
        let result = CompactResult {
            summary: summary.clone(),
            first_kept_entry_id,
            tokens_before,
        };
        if let Some(sink) = self.inner.sink.lock().unwrap().clone() {
            sink.record_compaction(&result);
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            // Rebuild only if nothing was appended while summarizing.
            let msg_split = split.min(state.messages.len());
            let ids_split = split.min(state.entry_ids.len());
            let kept = state.messages.split_off(msg_split);
            let kept_ids = state.entry_ids.split_off(ids_split);
            state.messages = Vec::with_capacity(kept.len() + 1);
            state.entry_ids = Vec::with_capacity(kept.len() + 1);
            state.messages.push(Message::user(summary));
            state.entry_ids.push(None);
            state.messages.extend(kept);
            state.entry_ids.extend(kept_ids);
        }
        self.inner.bus.emit(AgentEvent::Compaction {
            tokens_before,
            forced,
        });
        Some(result)
    }
}

/// Predicted input tokens for the next turn: history plus the per-request
/// overhead (system prompt and tool schemas) that is not part of history.
fn estimate_tokens(state: &State) -> usize {
    let history: usize = state.messages.iter().map(Message::approx_tokens).sum();
    let system = state
        .system_prompt
        .as_ref()
        .map(|s| s.len() / 4)
        .unwrap_or(0);
    let schemas: usize = state
        .tools
        .iter()
        .map(|t| {
            (t.name().len() + t.description().len() + t.parameters_schema().to_string().len()) / 4
        })
        .sum();
    history + system + schemas
}

/// Empty assistant message for the current model: the `messageStart`
/// payload, and the base for materialized failures.
fn message_shell(model: &Model) -> AssistantMessage {
    AssistantMessage {
        content: vec![],
        api: model.api.clone(),
        provider: model.provider.clone(),
        model: model.id.clone(),
        usage: TokenUsage::default(),
        stop_reason: StopReason::Stop,
        error_message: None,
        invalid_tool_call_ids: vec![],
        timestamp: Utc::now(),
    }
}

fn error_assistant(model: &Model, error: impl Into<String>) -> AssistantMessage {
    AssistantMessage {
        stop_reason: StopReason::Error,
        error_message: Some(error.into()),
        ..message_shell(model)
    }
}

/// Synthetic assistant appended when a turn is aborted during tool
/// execution; the transformer drops it (and never replays it) on the next
/// provider call.
fn aborted_assistant(template: &AssistantMessage) -> AssistantMessage {
    AssistantMessage {
        content: vec![],
        api: template.api.clone(),
        provider: template.provider.clone(),
        model: template.model.clone(),
        usage: TokenUsage::default(),
        stop_reason: StopReason::Aborted,
        error_message: Some("aborted by user".into()),
        invalid_tool_call_ids: vec![],
        timestamp: Utc::now(),
    }
}

/// Wire conversion for custom messages the loop itself produces.  Bash
/// pass-through executions replay as user messages carrying the output.
pub fn default_custom_converter(role: &str, payload: &Value) -> Option<Message> {
    match role {
        "bashExecution" => {
            let command = payload["command"].as_str().unwrap_or("");
            let output = payload["output"].as_str().unwrap_or("");
            Some(Message::user(format!("Ran bash command:\n$ {command}\n{output}")))
        }
        _ => None,
    }
}
