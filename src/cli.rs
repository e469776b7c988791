// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Interactive line-based session (default).
    Interactive,
    /// Line-delimited JSON over stdin/stdout for external drivers.
    Rpc,
}

/// pi — an interactive, terminal-based AI coding agent.
#[derive(Debug, Parser)]
#[command(name = "pi", version, about)]
pub struct Cli {
    /// Prompt text; with -p the response is printed and the process exits.
    pub prompt: Vec<String>,

    /// One-shot print mode: send the prompt, print the reply, exit.
    #[arg(short = 'p', long)]
    pub print: bool,

    /// Front-end mode.
    #[arg(long, value_enum, default_value = "interactive")]
    pub mode: Mode,

    /// Continue the most recent session for this directory.
    #[arg(short = 'c', long = "continue")]
    pub continue_recent: bool,

    /// Resume a specific session file.
    #[arg(long)]
    pub resume: Option<PathBuf>,

    /// Open a session file at an explicit path.
    #[arg(long)]
    pub session: Option<PathBuf>,

    /// List stored sessions for this directory and exit.
    #[arg(long)]
    pub list_sessions: bool,

    /// Do not write the session to disk.
    #[arg(long)]
    pub ephemeral: bool,

    /// Model override: "provider/id", a bare id, or "mock".
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Thinking level: off | low | medium | high.
    #[arg(long)]
    pub thinking: Option<String>,

    /// Replace the built-in system prompt.
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Disable hook extensions.
    #[arg(long)]
    pub no_extensions: bool,

    /// Disable prompt templates.
    #[arg(long)]
    pub no_prompt_templates: bool,

    /// Export a session file to HTML and exit.
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// HTML output path for --export.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Verbose logging to stderr (or PI_LOG_FILE when set).
    #[arg(long, short)]
    pub verbose: bool,
}

impl Cli {
    pub fn prompt_text(&self) -> Option<String> {
        if self.prompt.is_empty() {
            None
        } else {
            Some(self.prompt.join(" "))
        }
    }
}
