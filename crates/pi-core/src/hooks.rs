// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-process hooks: extensions that subscribe to agent lifecycle points,
//! may veto tool calls, rewrite context, and register slash commands.
//!
//! Hooks are trust-equivalent to the agent itself; they are linked at build
//! time and registered through `CreateAgentSessionOptions`-level wiring,
//! never loaded dynamically.  A failing hook is reported as a `hook_error`
//! event and the turn continues, unless a blocking handler explicitly
//! blocks.

use std::sync::Arc;

use async_trait::async_trait;
use pi_model::Message;
use serde_json::Value;

use crate::bus::EventBus;
use crate::events::AgentEvent;

/// A slash command contributed by a hook.
#[derive(Debug, Clone)]
pub struct HookCommand {
    pub name: String,
    pub description: String,
    /// Expansion template; `$ARGUMENTS` is replaced with the remainder of
    /// the prompt line.
    pub template: String,
}

/// Verdict of a blocking `tool_pre` handler.
#[derive(Debug, Clone, PartialEq)]
pub enum HookDecision {
    Allow,
    Block { reason: String },
}

#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_session_start(&self, _session_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs before every tool call; returning `Block` turns the call into
    /// an error tool result without executing it.
    async fn on_tool_pre(&self, _tool_name: &str, _args: &Value) -> anyhow::Result<HookDecision> {
        Ok(HookDecision::Allow)
    }

    async fn on_tool_post(
        &self,
        _tool_name: &str,
        _result_text: &str,
        _is_error: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// May rewrite the message list before it is transformed for the
    /// provider.
    async fn on_context(&self, messages: Vec<Message>) -> anyhow::Result<Vec<Message>> {
        Ok(messages)
    }

    fn commands(&self) -> Vec<HookCommand> {
        vec![]
    }
}

/// Multiplexes event emissions to all registered hooks and merges their
/// results.
pub struct HookRunner {
    hooks: Vec<Arc<dyn Hook>>,
    bus: EventBus,
}

impl HookRunner {
    pub fn new(hooks: Vec<Arc<dyn Hook>>, bus: EventBus) -> Self {
        Self { hooks, bus }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn report(&self, hook: &str, event: &str, error: &anyhow::Error) {
        self.bus.emit(AgentEvent::HookError {
            hook: hook.to_string(),
            event: event.to_string(),
            error: error.to_string(),
        });
    }

    pub async fn session_start(&self, session_id: &str) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_session_start(session_id).await {
                self.report(hook.name(), "session_start", &e);
            }
        }
    }

    /// The first hook that blocks wins; hook failures never block.
    pub async fn tool_pre(&self, tool_name: &str, args: &Value) -> HookDecision {
        for hook in &self.hooks {
            match hook.on_tool_pre(tool_name, args).await {
                Ok(HookDecision::Allow) => {}
                Ok(block @ HookDecision::Block { .. }) => return block,
                Err(e) => self.report(hook.name(), "tool_pre", &e),
            }
        }
        HookDecision::Allow
    }

    pub async fn tool_post(&self, tool_name: &str, result_text: &str, is_error: bool) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_tool_post(tool_name, result_text, is_error).await {
                self.report(hook.name(), "tool_post", &e);
            }
        }
    }

    /// Context hooks run in registration order, each seeing the previous
    /// hook's output.  A failing hook leaves the list unchanged.
    pub async fn context(&self, mut messages: Vec<Message>) -> Vec<Message> {
        for hook in &self.hooks {
            match hook.on_context(messages.clone()).await {
                Ok(rewritten) => messages = rewritten,
                Err(e) => self.report(hook.name(), "context", &e),
            }
        }
        messages
    }

    pub fn commands(&self) -> Vec<HookCommand> {
        self.hooks.iter().flat_map(|h| h.commands()).collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct BlockingHook;

    #[async_trait]
    impl Hook for BlockingHook {
        fn name(&self) -> &str {
            "blocker"
        }
        async fn on_tool_pre(&self, tool_name: &str, _args: &Value) -> anyhow::Result<HookDecision> {
            if tool_name == "bash" {
                Ok(HookDecision::Block {
                    reason: "bash is disabled here".into(),
                })
            } else {
                Ok(HookDecision::Allow)
            }
        }
    }

    struct FailingHook;

    #[async_trait]
    impl Hook for FailingHook {
        fn name(&self) -> &str {
            "broken"
        }
        async fn on_tool_pre(&self, _: &str, _: &Value) -> anyhow::Result<HookDecision> {
            anyhow::bail!("hook exploded")
        }
        async fn on_context(&self, _messages: Vec<Message>) -> anyhow::Result<Vec<Message>> {
            anyhow::bail!("context hook exploded")
        }
    }

    struct PrependHook;

    #[async_trait]
    impl Hook for PrependHook {
        fn name(&self) -> &str {
            "prepend"
        }
        async fn on_context(&self, mut messages: Vec<Message>) -> anyhow::Result<Vec<Message>> {
            messages.insert(0, Message::user("injected context"));
            Ok(messages)
        }
        fn commands(&self) -> Vec<HookCommand> {
            vec![HookCommand {
                name: "inject".into(),
                description: "inject context".into(),
                template: "inject $ARGUMENTS".into(),
            }]
        }
    }

    #[tokio::test]
    async fn blocking_hook_vetoes_tool() {
        let runner = HookRunner::new(vec![Arc::new(BlockingHook)], EventBus::new("s"));
        assert_eq!(
            runner.tool_pre("bash", &json!({})).await,
            HookDecision::Block {
                reason: "bash is disabled here".into()
            }
        );
        assert_eq!(runner.tool_pre("read", &json!({})).await, HookDecision::Allow);
    }

    #[tokio::test]
    async fn failing_hook_reports_error_and_allows() {
        let bus = EventBus::new("s");
        let mut sub = bus.subscribe();
        let runner = HookRunner::new(vec![Arc::new(FailingHook)], bus.clone());
        assert_eq!(runner.tool_pre("bash", &json!({})).await, HookDecision::Allow);
        match sub.recv().await.unwrap().event {
            AgentEvent::HookError { hook, event, error } => {
                assert_eq!(hook, "broken");
                assert_eq!(event, "tool_pre");
                assert!(error.contains("exploded"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn context_hooks_chain_and_survive_failures() {
        let runner = HookRunner::new(
            vec![Arc::new(FailingHook), Arc::new(PrependHook)],
            EventBus::new("s"),
        );
        let out = runner.context(vec![Message::user("original")]).await;
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Message::User { content, .. }
            if content.as_text() == Some("injected context")));
    }

    #[test]
    fn commands_are_merged_across_hooks() {
        let runner = HookRunner::new(
            vec![Arc::new(BlockingHook), Arc::new(PrependHook)],
            EventBus::new("s"),
        );
        let commands = runner.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].name, "inject");
    }
}
