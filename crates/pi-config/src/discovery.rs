// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model discovery: which catalog models are usable with the credentials
//! present in the environment.

use std::path::PathBuf;

use anyhow::bail;
use pi_model::{catalog, gateway_for, Model, ThinkingLevel};

use crate::schema::Settings;

/// Returns `true` when credentials for `provider` are present.
pub fn provider_key_available(provider: &str) -> bool {
    let has = |var: &str| std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false);
    match provider {
        "anthropic" => has("ANTHROPIC_API_KEY") || has("ANTHROPIC_OAUTH_TOKEN"),
        "mock" => true,
        other => gateway_for(other).map(|g| has(g.key_env)).unwrap_or(false),
    }
}

/// All catalog models whose provider has credentials.  The mock model is
/// appended when `PI_MOCK=1` so offline runs have something to talk to.
pub fn available_models() -> Vec<Model> {
    let mut models: Vec<Model> = catalog::static_catalog()
        .into_iter()
        .filter(|m| provider_key_available(&m.provider))
        .collect();
    if std::env::var("PI_MOCK").map(|v| v == "1").unwrap_or(false) {
        models.push(catalog::mock_model());
    }
    models
}

/// Resolve a model override string: `"provider/id"`, or a bare id looked up
/// across the catalog.  A scoped-model entry may pin a thinking level with
/// a colon suffix (`"openai/gpt-5.2:high"`).
pub fn resolve_model(spec: &str) -> anyhow::Result<(Model, Option<ThinkingLevel>)> {
    let (model_part, level_part) = match spec.rsplit_once(':') {
        Some((m, l)) if matches!(l, "off" | "low" | "medium" | "high") => (m, Some(l)),
        _ => (spec, None),
    };
    let level = level_part.map(|l| match l {
        "low" => ThinkingLevel::Low,
        "medium" => ThinkingLevel::Medium,
        "high" => ThinkingLevel::High,
        _ => ThinkingLevel::Off,
    });

    let model = if model_part == "mock" || model_part == "mock/mock-model" {
        Some(catalog::mock_model())
    } else if let Some((provider, id)) = model_part.split_once('/') {
        // Provider ids never contain '/', but model ids may ("org/model" on
        // gateways); fall back to a bare-id lookup when the prefix is not a
        // known provider.
        catalog::lookup(provider, id).or_else(|| catalog::lookup_by_id(model_part))
    } else {
        catalog::lookup_by_id(model_part)
    };
    match model {
        Some(m) => Ok((m, level)),
        None => bail!("unknown model: {spec}"),
    }
}

/// How the session is created or attached.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SessionMode {
    #[default]
    New,
    ContinueRecent,
    Resume(PathBuf),
    OpenPath(PathBuf),
}

/// Everything a front-end resolves before constructing an agent session.
#[derive(Debug, Clone)]
pub struct CreateAgentSessionOptions {
    pub mode: SessionMode,
    /// In-memory session: same API, no disk writes.
    pub ephemeral: bool,
    pub cwd: PathBuf,
    pub agent_dir: PathBuf,
    pub model: Option<Model>,
    pub thinking_level: Option<ThinkingLevel>,
    pub system_prompt: Option<String>,
    pub settings: Settings,
    pub no_extensions: bool,
    pub no_prompt_templates: bool,
}

impl CreateAgentSessionOptions {
    pub fn new(cwd: PathBuf, agent_dir: PathBuf, settings: Settings) -> Self {
        Self {
            mode: SessionMode::New,
            ephemeral: false,
            cwd,
            agent_dir,
            model: None,
            thinking_level: None,
            system_prompt: None,
            settings,
            no_extensions: false,
            no_prompt_templates: false,
        }
    }

    /// Pick the startup model: explicit override, then the settings default,
    /// then the first available model.  No model at all is a fatal
    /// configuration error.
    pub fn resolve_startup_model(&self) -> anyhow::Result<(Model, ThinkingLevel)> {
        if let Some(model) = &self.model {
            let level = self
                .thinking_level
                .unwrap_or(self.settings.default_thinking_level);
            return Ok((model.clone(), level));
        }
        if let Some(spec) = &self.settings.default_model {
            let (model, pinned) = resolve_model(spec)?;
            let level = self
                .thinking_level
                .or(pinned)
                .unwrap_or(self.settings.default_thinking_level);
            return Ok((model, level));
        }
        let available = available_models();
        match available.into_iter().next() {
            Some(model) => {
                let level = self
                    .thinking_level
                    .unwrap_or(self.settings.default_thinking_level);
                Ok((model, level))
            }
            None => bail!(
                "no models available: set one of ANTHROPIC_API_KEY, OPENAI_API_KEY, \
                 GEMINI_API_KEY, GROQ_API_KEY, CEREBRAS_API_KEY, XAI_API_KEY, \
                 OPENROUTER_API_KEY, ZAI_API_KEY"
            ),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
