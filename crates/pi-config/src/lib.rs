// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Settings, agent-dir resolution and model discovery.

mod discovery;
mod loader;
mod schema;

pub use discovery::{
    available_models, provider_key_available, resolve_model, CreateAgentSessionOptions,
    SessionMode,
};
pub use loader::{agent_dir, commands_dir, load_settings, sessions_root, settings_path};
pub use schema::{CompactionSettings, QueueMode, RetrySettings, Settings};
