// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: static metadata and the capability matrix for known models.

use serde::{Deserialize, Serialize};

/// Input modalities accepted by a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputModality {
    Text,
    Image,
}

fn default_input_modalities() -> Vec<InputModality> {
    // Conservative default: text only.  Vision-capable models must list
    // `image` explicitly in models.yaml.
    vec![InputModality::Text]
}

/// Which request field carries the output-token limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxTokensField {
    #[default]
    MaxTokens,
    MaxCompletionTokens,
}

/// Wire-format quirks of a model's endpoint.  Adapters consult these flags
/// to shape requests; the transformer consults the history-affecting ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Compat {
    pub supports_store: bool,
    pub supports_developer_role: bool,
    pub supports_reasoning_effort: bool,
    pub max_tokens_field: MaxTokensField,
    pub requires_tool_result_name: bool,
    pub requires_assistant_after_tool_result: bool,
    pub requires_thinking_as_text: bool,
    /// Mistral constrains tool-call ids to exactly 9 alphanumerics.
    pub requires_mistral_tool_ids: bool,
}

impl Default for Compat {
    fn default() -> Self {
        Self {
            supports_store: true,
            supports_developer_role: true,
            supports_reasoning_effort: false,
            max_tokens_field: MaxTokensField::MaxTokens,
            requires_tool_result_name: false,
            requires_assistant_after_tool_result: false,
            requires_thinking_as_text: false,
            requires_mistral_tool_ids: false,
        }
    }
}

/// Metadata for a single model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Provider-scoped model identifier (e.g. "claude-opus-4-6")
    pub id: String,
    /// Human-readable display name
    pub name: String,
    /// Wire protocol: "anthropic-messages" | "openai-completions" |
    /// "openai-responses" | "mock"
    pub api: String,
    /// Provider identifier: "anthropic" | "openai" | "groq" | ...
    pub provider: String,
    /// Whether the model emits reasoning/thinking content
    #[serde(default)]
    pub reasoning: bool,
    /// Accepted input modalities.  Defaults to `[text]`.
    #[serde(default = "default_input_modalities")]
    pub input: Vec<InputModality>,
    /// Total context window in tokens
    pub context_window: u32,
    /// Maximum output tokens per completion
    pub max_tokens: u32,
    #[serde(default)]
    pub compat: Compat,
}

impl Model {
    pub fn supports_images(&self) -> bool {
        self.input.contains(&InputModality::Image)
    }

    /// Stable "provider/id" form used in logs and the RPC surface.
    pub fn qualified_id(&self) -> String {
        format!("{}/{}", self.provider, self.id)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<Model>,
}

/// Return all entries from the bundled static catalog.
pub fn static_catalog() -> Vec<Model> {
    let yaml = include_str!("../models.yaml");
    let catalog: CatalogFile =
        serde_yaml::from_str(yaml).expect("bundled models.yaml must be valid");
    catalog.models
}

/// Look up a single model by provider and id (or display name).
pub fn lookup(provider: &str, model_id: &str) -> Option<Model> {
    static_catalog()
        .into_iter()
        .find(|m| m.provider == provider && (m.id == model_id || m.name == model_id))
}

/// Look up a model by bare id without a provider prefix.  Returns the first
/// matching entry.
pub fn lookup_by_id(model_id: &str) -> Option<Model> {
    static_catalog()
        .into_iter()
        .find(|m| m.id == model_id || m.name == model_id)
}

/// A deterministic mock model for tests and offline smoke runs.
pub fn mock_model() -> Model {
    Model {
        id: "mock-model".into(),
        name: "Mock".into(),
        api: "mock".into(),
        provider: "mock".into(),
        reasoning: false,
        input: vec![InputModality::Text],
        context_window: 32_768,
        max_tokens: 4_096,
        compat: Compat::default(),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
