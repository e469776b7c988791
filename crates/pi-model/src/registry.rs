// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Process-wide provider registry.
//!
//! Adapters are registered under a source tag so plugins can add providers at
//! startup and be unloaded cleanly with [`unregister`].  Lookup is by the
//! `api` string carried on each [`crate::catalog::Model`].

use std::sync::{Arc, Mutex, OnceLock};

use crate::{
    anthropic::AnthropicProvider, mock::MockProvider, openai::OpenAiCompletionsProvider,
    provider::Provider, responses::OpenAiResponsesProvider,
};

/// Source tag for the built-in adapters.
pub const BUILTIN_SOURCE: &str = "builtin";

struct Registration {
    source: String,
    provider: Arc<dyn Provider>,
}

fn registry() -> &'static Mutex<Vec<Registration>> {
    static REGISTRY: OnceLock<Mutex<Vec<Registration>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(builtins()))
}

fn builtins() -> Vec<Registration> {
    let providers: Vec<Arc<dyn Provider>> = vec![
        Arc::new(AnthropicProvider::new()),
        Arc::new(OpenAiCompletionsProvider::new()),
        Arc::new(OpenAiResponsesProvider::new()),
        Arc::new(MockProvider::default()),
    ];
    providers
        .into_iter()
        .map(|provider| Registration {
            source: BUILTIN_SOURCE.to_string(),
            provider,
        })
        .collect()
}

/// Register a provider under a source tag.  A later registration for the
/// same api shadows earlier ones until it is unregistered.
pub fn register(provider: Arc<dyn Provider>, source_id: &str) {
    registry().lock().unwrap().push(Registration {
        source: source_id.to_string(),
        provider,
    });
}

/// Remove every provider registered under `source_id`.
pub fn unregister(source_id: &str) {
    registry().lock().unwrap().retain(|r| r.source != source_id);
}

/// Remove all providers, built-ins included.
pub fn clear() {
    registry().lock().unwrap().clear();
}

/// Restore the registry to the built-in set.
pub fn reset() {
    *registry().lock().unwrap() = builtins();
}

/// Look up the active provider for an api.  The most recently registered
/// provider wins.
pub fn get(api: &str) -> Option<Arc<dyn Provider>> {
    registry()
        .lock()
        .unwrap()
        .iter()
        .rev()
        .find(|r| r.provider.api() == api)
        .map(|r| Arc::clone(&r.provider))
}

/// All apis currently served, most recent registration first.
pub fn registered_apis() -> Vec<String> {
    let guard = registry().lock().unwrap();
    let mut apis = Vec::new();
    for r in guard.iter().rev() {
        let api = r.provider.api().to_string();
        if !apis.contains(&api) {
            apis.push(api);
        }
    }
    apis
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
