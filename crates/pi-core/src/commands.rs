// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Slash-command expansion.
//!
//! A prompt starting with `/` is matched against file-based commands,
//! prompt templates, and hook-registered commands, in that order.  The
//! template replaces the prompt text; `$ARGUMENTS` inside a template is
//! substituted with the remainder of the line.

use std::path::Path;

use crate::hooks::HookCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    File,
    Template,
    Hook,
}

#[derive(Debug, Clone)]
pub struct SlashCommand {
    pub name: String,
    pub description: String,
    pub template: String,
    pub source: CommandSource,
}

/// Load `*.md` files from a directory as commands.  The file stem is the
/// command name; the first non-empty line doubles as the description.
pub fn load_dir_commands(dir: &Path, source: CommandSource) -> Vec<SlashCommand> {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut commands: Vec<SlashCommand> = read_dir
        .flatten()
        .filter_map(|e| {
            let path = e.path();
            if path.extension().and_then(|x| x.to_str()) != Some("md") {
                return None;
            }
            let name = path.file_stem()?.to_string_lossy().to_string();
            let template = std::fs::read_to_string(&path).ok()?;
            let description = template
                .lines()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("")
                .trim()
                .trim_start_matches('#')
                .trim()
                .to_string();
            Some(SlashCommand {
                name,
                description,
                template,
                source,
            })
        })
        .collect();
    commands.sort_by(|a, b| a.name.cmp(&b.name));
    commands
}

pub fn hook_commands(commands: Vec<HookCommand>) -> Vec<SlashCommand> {
    commands
        .into_iter()
        .map(|c| SlashCommand {
            name: c.name,
            description: c.description,
            template: c.template,
            source: CommandSource::Hook,
        })
        .collect()
}

/// Expand a prompt when it starts with a known slash command.  Returns
/// `None` when the prompt is not a command (including unknown commands —
/// those go to the model verbatim).
pub fn expand_prompt(prompt: &str, commands: &[SlashCommand]) -> Option<String> {
    let rest = prompt.strip_prefix('/')?;
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((n, a)) => (n, a.trim()),
        None => (rest.trim(), ""),
    };
    let command = commands.iter().find(|c| c.name == name)?;
    let expanded = if command.template.contains("$ARGUMENTS") {
        command.template.replace("$ARGUMENTS", args)
    } else if args.is_empty() {
        command.template.clone()
    } else {
        format!("{}\n\n{}", command.template.trim_end(), args)
    };
    Some(expanded)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
