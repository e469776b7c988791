// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! High-level orchestration: one `AgentSession` owns the agent, the session
//! store, settings, and the event bus, and exposes the operations that
//! front-ends (interactive, print, RPC) drive.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pi_config::{CreateAgentSessionOptions, QueueMode, SessionMode};
use pi_model::{catalog, Message, Model, ThinkingLevel, TokenUsage};
use pi_session::{EntryKind, SessionStore, StoreError};
use pi_tools::{builtin::BashTool, Tool, ToolRegistry};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agent::{Agent, AgentConfig, EntrySink};
use crate::bus::{EventBus, EventSubscriber};
use crate::commands::{expand_prompt, hook_commands, load_dir_commands, CommandSource, SlashCommand};
use crate::compact::CompactResult;
use crate::hooks::{Hook, HookRunner};

/// Result of a direct bash pass-through execution.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BashResult {
    pub output: String,
    pub exit_code: Option<i64>,
    pub cancelled: bool,
    pub truncated: bool,
}

/// Result of moving the session onto an older entry.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkResult {
    pub selected_text: Option<String>,
    pub cancelled: bool,
}

/// One forkable user message.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkMessage {
    pub entry_id: String,
    pub text: String,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub session_id: String,
    pub session_file: Option<PathBuf>,
    pub entry_count: usize,
    pub message_count: usize,
    pub user_message_count: usize,
    pub assistant_message_count: usize,
    pub usage: TokenUsage,
}

/// Snapshot returned by `get_state`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateView {
    pub model: String,
    pub thinking_level: ThinkingLevel,
    pub is_streaming: bool,
    pub is_compacting: bool,
    pub steering_mode: QueueMode,
    pub follow_up_mode: QueueMode,
    pub session_file: Option<PathBuf>,
    pub session_id: String,
    pub session_name: Option<String>,
    pub auto_compaction_enabled: bool,
    pub message_count: usize,
    pub pending_message_count: usize,
}

#[derive(Debug, Clone)]
pub struct PromptOptions {
    pub expand_slash_commands: bool,
    /// `(base64 data, mime)` pairs attached to the user turn.
    pub images: Vec<(String, String)>,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            expand_slash_commands: true,
            images: Vec::new(),
        }
    }
}

/// Persists agent mutations into the session store.
struct StoreSink {
    store: Arc<Mutex<SessionStore>>,
}

impl EntrySink for StoreSink {
    fn append_message(&self, message: &Message) -> Option<String> {
        let mut store = self.store.lock().unwrap();
        let kind = match message {
            Message::Custom { role, payload, .. } => EntryKind::CustomMessage {
                role: role.clone(),
                payload: payload.clone(),
            },
            other => EntryKind::Message {
                message: other.clone(),
            },
        };
        Some(store.append(kind).id.clone())
    }

    fn record_compaction(&self, result: &CompactResult) {
        let mut store = self.store.lock().unwrap();
        store.append(EntryKind::Compaction {
            summary: result.summary.clone(),
            first_kept_entry_id: result.first_kept_entry_id.clone(),
            tokens_before: result.tokens_before,
            details: None,
        });
    }
}

pub struct AgentSession {
    agent: Agent,
    bus: EventBus,
    store: Arc<Mutex<SessionStore>>,
    registry: Arc<ToolRegistry>,
    hooks: Option<Arc<HookRunner>>,
    commands: Vec<SlashCommand>,
    models: Vec<Model>,
    cwd: PathBuf,
    sessions_root: PathBuf,
    ephemeral: bool,
    bash_cancel: Mutex<Option<CancellationToken>>,
    is_compacting: AtomicBool,
}

impl AgentSession {
    pub async fn create(
        options: CreateAgentSessionOptions,
        registry: Arc<ToolRegistry>,
        hooks: Vec<Arc<dyn Hook>>,
    ) -> anyhow::Result<Self> {
        let (model, thinking_level) = options.resolve_startup_model()?;
        let sessions_root = pi_config::sessions_root(&options.agent_dir);

        let store = if options.ephemeral {
            SessionStore::in_memory(&options.cwd)
        } else {
            match &options.mode {
                SessionMode::New => SessionStore::create(&sessions_root, &options.cwd)?,
                SessionMode::ContinueRecent => {
                    match SessionStore::continue_recent(&sessions_root, &options.cwd) {
                        Ok(store) => store,
                        Err(StoreError::NoRecentSession) => {
                            SessionStore::create(&sessions_root, &options.cwd)?
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                SessionMode::Resume(path) | SessionMode::OpenPath(path) => {
                    SessionStore::open(path, &options.cwd)?
                }
            }
        };

        let bus = EventBus::new(store.session_id());
        let agent = Agent::new(model.clone(), thinking_level, bus.clone());
        let settings = options.settings.clone();
        // Scoped models: the configured cycle list, or everything available.
        let models = if settings.scoped_models.is_empty() {
            pi_config::available_models()
        } else {
            let mut resolved = Vec::new();
            for spec in &settings.scoped_models {
                match pi_config::resolve_model(spec) {
                    Ok((m, _)) => resolved.push(m),
                    Err(e) => warn!("ignoring scoped model {spec}: {e}"),
                }
            }
            resolved
        };
        agent.configure(AgentConfig::from(&settings));

        let tools: Vec<Arc<dyn Tool>> = registry
            .names()
            .iter()
            .filter_map(|n| registry.get(n))
            .collect();
        let tool_names: Vec<String> = tools.iter().map(|t| t.name().to_string()).collect();
        agent.set_tools(tools);
        agent.set_system_prompt(Some(
            options
                .system_prompt
                .clone()
                .unwrap_or_else(|| default_system_prompt(&options.cwd, &tool_names)),
        ));

        let hooks_runner = if hooks.is_empty() || options.no_extensions {
            None
        } else {
            Some(Arc::new(HookRunner::new(hooks, bus.clone())))
        };
        agent.set_hooks(hooks_runner.clone());

        let mut commands =
            load_dir_commands(&pi_config::commands_dir(&options.agent_dir), CommandSource::File);
        if !options.no_prompt_templates {
            commands.extend(load_dir_commands(
                &options.agent_dir.join("templates"),
                CommandSource::Template,
            ));
        }
        if let Some(runner) = &hooks_runner {
            commands.extend(hook_commands(runner.commands()));
        }

        let store = Arc::new(Mutex::new(store));
        agent.set_sink(Some(Arc::new(StoreSink {
            store: Arc::clone(&store),
        }) as Arc<dyn EntrySink>));

        let session = Self {
            agent,
            bus,
            store,
            registry,
            hooks: hooks_runner,
            commands,
            models,
            cwd: options.cwd.clone(),
            sessions_root,
            ephemeral: options.ephemeral,
            bash_cancel: Mutex::new(None),
            is_compacting: AtomicBool::new(false),
        };

        // Seed from the stored branch, then make sure the active model is
        // recorded for fresh sessions (the context walk projects the last
        // modelChange entry on the path).
        session.rebuild_from_store();
        let has_model_entry = {
            let store = session.store.lock().unwrap();
            store
                .entries()
                .iter()
                .any(|e| matches!(e.kind, EntryKind::ModelChange { .. }))
        };
        // Explicit overrides win over whatever the stored branch projected.
        if let Some(m) = &options.model {
            session.agent.set_model(m.clone());
        }
        if let Some(level) = options.thinking_level {
            session.agent.set_thinking_level(level);
        }
        if !has_model_entry {
            let m = session.agent.model();
            session.store.lock().unwrap().append(EntryKind::ModelChange {
                provider: m.provider.clone(),
                model_id: m.id.clone(),
            });
            let level = session.agent.thinking_level();
            if level != ThinkingLevel::Off {
                session
                    .store
                    .lock()
                    .unwrap()
                    .append(EntryKind::ThinkingLevel {
                        thinking_level: level,
                    });
            }
        }

        if let Some(runner) = &session.hooks {
            runner.session_start(&session.session_id()).await;
        }
        Ok(session)
    }

    /// Reset the agent's history and model from the store's active branch.
    fn rebuild_from_store(&self) {
        let ctx = self.store.lock().unwrap().build_session_context();
        if let Some((provider, model_id)) = &ctx.model {
            match catalog::lookup(provider, model_id) {
                Some(m) => self.agent.set_model(m),
                None if provider == "mock" => self.agent.set_model(catalog::mock_model()),
                None => warn!("session references unknown model {provider}/{model_id}"),
            }
        }
        if let Some(level) = ctx.thinking_level {
            self.agent.set_thinking_level(level);
        }
        self.agent.replace_messages(ctx.messages, ctx.entry_ids);
    }

    // ── Event access ──────────────────────────────────────────────────────────

    pub fn subscribe(&self) -> EventSubscriber {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    // ── Prompting ─────────────────────────────────────────────────────────────

    /// Start a turn.  Returns a handle that resolves when the agent is
    /// idle again; RPC mode ignores it and follows the event stream.
    pub fn prompt(
        &self,
        text: &str,
        options: PromptOptions,
    ) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        if self.agent.is_streaming() {
            anyhow::bail!("agent is busy: a turn is already in progress");
        }
        let expanded = if options.expand_slash_commands {
            expand_prompt(text, &self.commands).unwrap_or_else(|| text.to_string())
        } else {
            text.to_string()
        };
        let message = if options.images.is_empty() {
            Message::user(expanded)
        } else {
            let mut blocks = vec![pi_model::ContentBlock::text(expanded)];
            for (data, mime) in options.images {
                blocks.push(pi_model::ContentBlock::Image { data, mime });
            }
            Message::user_with_blocks(blocks)
        };
        let agent = self.agent.clone();
        Ok(tokio::spawn(async move {
            if let Err(e) = agent.prompt_message(message).await {
                warn!("prompt failed: {e}");
            }
        }))
    }

    pub async fn prompt_and_wait(&self, text: &str, options: PromptOptions) -> anyhow::Result<()> {
        let handle = self.prompt(text, options)?;
        handle.await?;
        Ok(())
    }

    /// Queue a steering message; when the agent is idle this starts a turn
    /// immediately.  Never fails — a lost race with a starting turn falls
    /// back to the queue.
    pub fn steer(&self, text: &str) -> Option<tokio::task::JoinHandle<()>> {
        if self.agent.is_streaming() {
            self.agent.steer(text);
            return None;
        }
        match self.prompt(text, PromptOptions::default()) {
            Ok(handle) => Some(handle),
            Err(_) => {
                self.agent.steer(text);
                None
            }
        }
    }

    /// Queue a follow-up for after the current turn; idle agents start a
    /// turn immediately.
    pub fn follow_up(&self, text: &str) -> Option<tokio::task::JoinHandle<()>> {
        if self.agent.is_streaming() {
            self.agent.follow_up(text);
            return None;
        }
        match self.prompt(text, PromptOptions::default()) {
            Ok(handle) => Some(handle),
            Err(_) => {
                self.agent.follow_up(text);
                None
            }
        }
    }

    pub fn abort(&self) {
        self.agent.abort();
    }

    pub fn abort_retry(&self) {
        self.agent.abort_retry();
    }

    // ── Model and mode mutations ──────────────────────────────────────────────

    pub fn set_model(&self, provider: &str, model_id: &str) -> anyhow::Result<Model> {
        let model = if provider == "mock" {
            catalog::mock_model()
        } else {
            catalog::lookup(provider, model_id)
                .ok_or_else(|| anyhow::anyhow!("unknown model: {provider}/{model_id}"))?
        };
        self.agent.set_model(model.clone());
        self.store.lock().unwrap().append(EntryKind::ModelChange {
            provider: model.provider.clone(),
            model_id: model.id.clone(),
        });
        Ok(model)
    }

    /// Cycle through the scoped-model list; `direction` is ±1.
    pub fn cycle_model(&self, direction: i64) -> anyhow::Result<Model> {
        if self.models.is_empty() {
            anyhow::bail!("no models available to cycle through");
        }
        let current = self.agent.model();
        let index = self
            .models
            .iter()
            .position(|m| m.provider == current.provider && m.id == current.id)
            .unwrap_or(0);
        let len = self.models.len() as i64;
        let next = ((index as i64 + direction) % len + len) % len;
        let model = self.models[next as usize].clone();
        self.set_model(&model.provider.clone(), &model.id.clone())
    }

    pub fn get_available_models(&self) -> Vec<Model> {
        self.models.clone()
    }

    pub fn set_thinking_level(&self, level: ThinkingLevel) {
        self.agent.set_thinking_level(level);
        self.store.lock().unwrap().append(EntryKind::ThinkingLevel {
            thinking_level: level,
        });
    }

    pub fn cycle_thinking_level(&self) -> ThinkingLevel {
        let next = self.agent.thinking_level().cycle();
        self.set_thinking_level(next);
        next
    }

    pub fn set_steering_mode(&self, mode: QueueMode) {
        self.agent.update_config(|c| c.steering_mode = mode);
    }

    pub fn set_follow_up_mode(&self, mode: QueueMode) {
        self.agent.update_config(|c| c.follow_up_mode = mode);
    }

    pub fn set_auto_compaction(&self, enabled: bool) {
        self.agent.update_config(|c| c.auto_compaction = enabled);
    }

    pub fn set_auto_retry(&self, enabled: bool) {
        self.agent.update_config(|c| c.auto_retry = enabled);
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    pub async fn compact(
        &self,
        custom_instructions: Option<String>,
    ) -> anyhow::Result<CompactResult> {
        if self.is_compacting.swap(true, Ordering::SeqCst) {
            anyhow::bail!("compaction already in progress");
        }
        let result = self.agent.compact(custom_instructions).await;
        self.is_compacting.store(false, Ordering::SeqCst);
        result
    }

    // ── Session lifecycle ─────────────────────────────────────────────────────

    pub fn session_id(&self) -> String {
        self.store.lock().unwrap().session_id().to_string()
    }

    pub fn session_file(&self) -> Option<PathBuf> {
        self.store.lock().unwrap().path().map(Path::to_path_buf)
    }

    pub fn set_session_name(&self, name: &str) {
        self.store.lock().unwrap().append(EntryKind::SessionInfo {
            name: name.to_string(),
        });
    }

    /// Start a fresh session in the same cwd; the previous log stays on
    /// disk untouched.
    pub fn new_session(&self) -> anyhow::Result<String> {
        if self.agent.is_streaming() {
            anyhow::bail!("cannot start a new session while a turn is in progress");
        }
        let fresh = if self.ephemeral {
            SessionStore::in_memory(&self.cwd)
        } else {
            SessionStore::create(&self.sessions_root, &self.cwd)?
        };
        let id = fresh.session_id().to_string();
        {
            let mut store = self.store.lock().unwrap();
            *store = fresh;
            let model = self.agent.model();
            store.append(EntryKind::ModelChange {
                provider: model.provider.clone(),
                model_id: model.id.clone(),
            });
        }
        self.agent.clear_messages();
        self.bus.set_session_id(id.clone());
        self.agent.set_session_id(id.clone());
        Ok(id)
    }

    /// Load a different session file and rebuild the agent from its active
    /// branch.
    pub async fn switch_session(&self, path: &Path) -> anyhow::Result<String> {
        if self.agent.is_streaming() {
            anyhow::bail!("cannot switch sessions while a turn is in progress");
        }
        let opened = SessionStore::open(path, &self.cwd)?;
        let id = opened.session_id().to_string();
        *self.store.lock().unwrap() = opened;
        self.rebuild_from_store();
        self.bus.set_session_id(id.clone());
        self.agent.set_session_id(id.clone());
        if let Some(runner) = &self.hooks {
            runner.session_start(&id).await;
        }
        Ok(id)
    }

    /// Move the active leaf to an older entry.  The next prompt forks the
    /// tree at that point; the abandoned branch stays in the file.
    pub fn fork(&self, entry_id: &str) -> anyhow::Result<ForkResult> {
        if self.agent.is_streaming() {
            anyhow::bail!("cannot fork while a turn is in progress");
        }
        let selected_text = {
            let mut store = self.store.lock().unwrap();
            let entry = store
                .entry(entry_id)
                .ok_or_else(|| anyhow::anyhow!("unknown entry id: {entry_id}"))?;
            let text = entry.as_message().and_then(|m| match m {
                Message::User { content, .. } => content.as_text().map(str::to_string),
                _ => None,
            });
            // Keep the selected message's whole exchange: the leaf moves to
            // the last entry before the next user message, so the next
            // prompt forks the tree right after the selected exchange.
            let target_id = {
                let path = store.current_path();
                let index = path.iter().position(|e| e.id == entry_id).ok_or_else(|| {
                    anyhow::anyhow!("entry {entry_id} is not on the active branch")
                })?;
                let mut target = index;
                for (j, e) in path.iter().enumerate().skip(index + 1) {
                    if matches!(e.as_message(), Some(Message::User { .. })) {
                        break;
                    }
                    target = j;
                }
                path[target].id.clone()
            };
            store.set_leaf(&target_id)?;
            text
        };
        self.rebuild_from_store();
        Ok(ForkResult {
            selected_text,
            cancelled: false,
        })
    }

    /// User messages on the current branch, oldest first, for the fork
    /// picker.
    pub fn get_user_messages_for_forking(&self) -> Vec<ForkMessage> {
        let store = self.store.lock().unwrap();
        store
            .current_path()
            .iter()
            .filter_map(|entry| {
                let text = match entry.as_message()? {
                    Message::User { content, .. } => content.as_text().map(str::to_string),
                    _ => None,
                }?;
                Some(ForkMessage {
                    entry_id: entry.id.clone(),
                    text,
                })
            })
            .collect()
    }

    pub fn list_sessions(&self) -> Vec<pi_session::SessionInfo> {
        pi_session::list(&self.sessions_root, &self.cwd)
    }

    // ── Bash pass-through ─────────────────────────────────────────────────────

    /// Run a shell command outside the agent loop.  The output is recorded
    /// in history as a custom entry (role `bashExecution`) which replays to
    /// providers as a user message.
    pub async fn execute_bash(&self, command: &str) -> anyhow::Result<BashResult> {
        let cancel = CancellationToken::new();
        *self.bash_cancel.lock().unwrap() = Some(cancel.clone());
        let tool: Arc<dyn Tool> = self
            .registry
            .get("bash")
            .unwrap_or_else(|| Arc::new(BashTool::default()));
        let result = tool
            .execute(
                "bash_passthrough",
                json!({ "command": command }),
                cancel.clone(),
                None,
            )
            .await;
        *self.bash_cancel.lock().unwrap() = None;

        let cancelled = cancel.is_cancelled();
        let output = result.text();
        let details = result.details.clone().unwrap_or(json!({}));
        let exit_code = details["exitCode"].as_i64();
        let truncated = details["truncated"].as_bool().unwrap_or(false);
        self.agent.append_message(Message::custom(
            "bashExecution",
            json!({
                "command": command,
                "output": output,
                "exitCode": exit_code,
            }),
        ));
        Ok(BashResult {
            output,
            exit_code,
            cancelled,
            truncated,
        })
    }

    pub fn abort_bash(&self) {
        if let Some(cancel) = self.bash_cancel.lock().unwrap().as_ref() {
            cancel.cancel();
        }
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    pub fn get_state(&self) -> StateView {
        let snapshot = self.agent.snapshot();
        let config = self.agent.config();
        let store = self.store.lock().unwrap();
        StateView {
            model: snapshot.model.qualified_id(),
            thinking_level: snapshot.thinking_level,
            is_streaming: snapshot.is_streaming,
            is_compacting: self.is_compacting.load(Ordering::SeqCst),
            steering_mode: config.steering_mode,
            follow_up_mode: config.follow_up_mode,
            session_file: store.path().map(Path::to_path_buf),
            session_id: store.session_id().to_string(),
            session_name: store.name().map(str::to_string),
            auto_compaction_enabled: config.auto_compaction,
            message_count: snapshot.messages.len(),
            pending_message_count: self.agent.pending_message_count(),
        }
    }

    pub fn get_session_stats(&self) -> SessionStats {
        let messages = self.agent.messages();
        let store = self.store.lock().unwrap();
        SessionStats {
            session_id: store.session_id().to_string(),
            session_file: store.path().map(Path::to_path_buf),
            entry_count: store.entries().len(),
            message_count: messages.len(),
            user_message_count: messages.iter().filter(|m| m.is_user()).count(),
            assistant_message_count: messages
                .iter()
                .filter(|m| m.as_assistant().is_some())
                .count(),
            usage: self.agent.usage_total(),
        }
    }

    pub fn get_messages(&self) -> Vec<Message> {
        self.agent.messages()
    }

    pub fn get_last_assistant_text(&self) -> Option<String> {
        self.agent.last_assistant_text()
    }

    pub fn get_commands(&self) -> Vec<(String, String)> {
        self.commands
            .iter()
            .map(|c| (c.name.clone(), c.description.clone()))
            .collect()
    }

    /// Minimal transcript export; rendering polish lives outside the core.
    pub fn export_to_html(&self, output_path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
        let path = output_path.unwrap_or_else(|| {
            self.cwd
                .join(format!("pi-session-{}.html", self.session_id()))
        });
        let mut html = String::from("<!doctype html><meta charset=\"utf-8\"><pre>\n");
        for m in self.agent.messages() {
            let (who, text) = match &m {
                Message::User { content, .. } => {
                    ("user", content.as_text().unwrap_or("(multimodal)").to_string())
                }
                Message::Assistant(a) => ("assistant", a.text()),
                Message::ToolResult(r) => ("tool", r.text()),
                Message::Custom { role, .. } => (role.as_str(), String::new()),
            };
            html.push_str(&format!("[{who}]\n{}\n\n", escape_html(&text)));
        }
        html.push_str("</pre>\n");
        std::fs::write(&path, html)?;
        Ok(path)
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn default_system_prompt(cwd: &Path, tool_names: &[String]) -> String {
    format!(
        "You are pi, a coding agent running in a terminal.\n\
         Working directory: {}\n\
         Available tools: {}.\n\
         Use tools when they help; answer directly when they don't. Keep \
         responses concise — they are rendered in a terminal.",
        cwd.display(),
        if tool_names.is_empty() {
            "none".to_string()
        } else {
            tool_names.join(", ")
        }
    )
}
