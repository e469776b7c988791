// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use pi_model::ThinkingLevel;
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` falls back to `false`, so enabled-by-
/// default flags need a named function.
fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_threshold() -> f32 {
    0.85
}
fn default_keep_recent() -> usize {
    8
}

/// When a queued user message is applied.
///
/// `Interrupt` drains between tool batches inside the current turn; `Queue`
/// waits for the natural end of turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    #[default]
    Interrupt,
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct CompactionSettings {
    /// Compact when predicted input tokens exceed this fraction of the
    /// model's context window.
    pub threshold: f32,
    /// Messages preserved verbatim at the tail when compacting.
    pub keep_recent: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            keep_recent: default_keep_recent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    pub retry: RetrySettings,
    pub compaction: CompactionSettings,
    pub steering_mode: QueueMode,
    pub follow_up_mode: QueueMode,
    #[serde(default = "default_true")]
    pub auto_compaction: bool,
    #[serde(default = "default_true")]
    pub auto_retry: bool,
    /// Default model as "provider/id", e.g. "anthropic/claude-opus-4-6".
    pub default_model: Option<String>,
    pub default_thinking_level: ThinkingLevel,
    /// Models the UI cycles through with `cycle_model`; each may carry a
    /// pinned thinking level after a colon ("openai/gpt-5.2:high").
    pub scoped_models: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            compaction: CompactionSettings::default(),
            steering_mode: QueueMode::Interrupt,
            follow_up_mode: QueueMode::Queue,
            auto_compaction: true,
            auto_retry: true,
            default_model: None,
            default_thinking_level: ThinkingLevel::Off,
            scoped_models: Vec::new(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.retry.max_attempts, 3);
        assert_eq!(s.retry.max_delay_ms, 30_000);
        assert_eq!(s.compaction.threshold, 0.85);
        assert!(s.auto_compaction);
        assert!(s.auto_retry);
        assert_eq!(s.steering_mode, QueueMode::Interrupt);
        assert_eq!(s.follow_up_mode, QueueMode::Queue);
    }

    #[test]
    fn empty_yaml_yields_defaults() {
        let s: Settings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let s: Settings = serde_yaml::from_str(
            "retry:\n  max_attempts: 7\ncompaction:\n  threshold: 0.5\n",
        )
        .unwrap();
        assert_eq!(s.retry.max_attempts, 7);
        assert_eq!(s.retry.initial_delay_ms, 1_000);
        assert_eq!(s.compaction.threshold, 0.5);
        assert_eq!(s.compaction.keep_recent, 8);
    }

    #[test]
    fn queue_mode_parses_lowercase() {
        let s: Settings = serde_yaml::from_str("follow_up_mode: interrupt\n").unwrap();
        assert_eq!(s.follow_up_mode, QueueMode::Interrupt);
    }
}
