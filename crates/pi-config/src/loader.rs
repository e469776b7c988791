// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::schema::Settings;

/// Root directory for sessions, settings and commands.
///
/// `PI_CODING_AGENT_DIR` overrides; default is `$HOME/.pi/agent`.
pub fn agent_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PI_CODING_AGENT_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pi")
        .join("agent")
}

pub fn sessions_root(agent_dir: &Path) -> PathBuf {
    agent_dir.join("sessions")
}

pub fn settings_path(agent_dir: &Path) -> PathBuf {
    agent_dir.join("settings.yaml")
}

pub fn commands_dir(agent_dir: &Path) -> PathBuf {
    agent_dir.join("commands")
}

/// Load settings from `<agent_dir>/settings.yaml`.  A missing file yields
/// defaults; a malformed file is a configuration error (fatal at startup).
pub fn load_settings(agent_dir: &Path) -> anyhow::Result<Settings> {
    let path = settings_path(agent_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
