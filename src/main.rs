// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::io::Write as _;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Mode};
use pi_config::{CreateAgentSessionOptions, SessionMode};
use pi_core::{AgentEvent, AgentSession, MessageDelta, PromptOptions};
use pi_model::ThinkingLevel;
use pi_tools::{builtin, ToolRegistry};

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("pi: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(run(cli)).unwrap_or_else(|e| {
        eprintln!("pi: {e}");
        1
    });
    std::process::exit(code);
}

/// Logging goes to stderr (or PI_LOG_FILE); stdout belongs to the
/// transcript in interactive/print mode and to the protocol in RPC mode.
fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "warn" })
    });
    if let Ok(path) = std::env::var("PI_LOG_FILE") {
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
                .init();
            return;
        }
    }
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let agent_dir = pi_config::agent_dir();
    let cwd = std::env::current_dir()?;
    let settings = pi_config::load_settings(&agent_dir)?;

    if cli.list_sessions {
        let sessions = pi_session::list(&pi_config::sessions_root(&agent_dir), &cwd);
        for info in sessions {
            println!(
                "{}\t{}\t{}",
                info.path.display(),
                info.message_count,
                info.first_message.as_deref().unwrap_or("(empty)")
            );
        }
        return Ok(0);
    }

    let mut options = CreateAgentSessionOptions::new(cwd, agent_dir, settings);
    options.ephemeral = cli.ephemeral;
    options.system_prompt = cli.system_prompt.clone();
    options.no_extensions = cli.no_extensions;
    options.no_prompt_templates = cli.no_prompt_templates;
    options.mode = if let Some(path) = &cli.export {
        if !path.exists() {
            eprintln!("pi: bad --export source: {}", path.display());
            return Ok(1);
        }
        SessionMode::OpenPath(path.clone())
    } else if let Some(path) = &cli.resume {
        SessionMode::Resume(path.clone())
    } else if let Some(path) = &cli.session {
        SessionMode::OpenPath(path.clone())
    } else if cli.continue_recent {
        SessionMode::ContinueRecent
    } else {
        SessionMode::New
    };
    if let Some(spec) = &cli.model {
        let (model, pinned) = pi_config::resolve_model(spec)?;
        options.model = Some(model);
        options.thinking_level = pinned;
    }
    if let Some(level) = &cli.thinking {
        options.thinking_level = Some(parse_thinking_level(level)?);
    }

    let mut tools = ToolRegistry::new();
    tools.register(builtin::BashTool::default());
    tools.register(builtin::CalculateTool);

    let session = AgentSession::create(options, Arc::new(tools), vec![]).await?;

    if cli.export.is_some() {
        let path = session.export_to_html(cli.output.clone())?;
        println!("{}", path.display());
        return Ok(0);
    }

    match cli.mode {
        Mode::Rpc => {
            pi_rpc::run(Arc::new(session)).await?;
            Ok(0)
        }
        Mode::Interactive => {
            if cli.print {
                let prompt = cli
                    .prompt_text()
                    .ok_or_else(|| anyhow::anyhow!("print mode requires a prompt"))?;
                run_print(&session, &prompt).await
            } else {
                run_interactive(session, cli.prompt_text()).await
            }
        }
    }
}

fn parse_thinking_level(s: &str) -> anyhow::Result<ThinkingLevel> {
    match s {
        "off" => Ok(ThinkingLevel::Off),
        "low" => Ok(ThinkingLevel::Low),
        "medium" => Ok(ThinkingLevel::Medium),
        "high" => Ok(ThinkingLevel::High),
        other => anyhow::bail!("unknown thinking level: {other} (off|low|medium|high)"),
    }
}

/// One-shot mode: stream the reply to stdout, exit when the agent is idle.
async fn run_print(session: &AgentSession, prompt: &str) -> anyhow::Result<i32> {
    let mut subscriber = session.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(envelope) = subscriber.recv().await {
            match envelope.event {
                AgentEvent::MessageUpdate {
                    delta: MessageDelta::Text { text },
                } => {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                AgentEvent::AgentEnd => {
                    println!();
                    break;
                }
                _ => {}
            }
        }
    });
    session
        .prompt_and_wait(prompt, PromptOptions::default())
        .await?;
    let _ = printer.await;
    let state = session.agent().snapshot();
    Ok(if state.error.is_some() { 1 } else { 0 })
}

/// Minimal interactive loop: each stdin line is a prompt; rendering polish
/// (TUI, themes, editors) lives outside the core.
async fn run_interactive(session: AgentSession, initial: Option<String>) -> anyhow::Result<i32> {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let session = Arc::new(session);
    let mut subscriber = session.subscribe();
    tokio::spawn(async move {
        while let Some(envelope) = subscriber.recv().await {
            match envelope.event {
                AgentEvent::MessageUpdate {
                    delta: MessageDelta::Text { text },
                } => {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                AgentEvent::ToolExecutionStart { tool_name, .. } => {
                    println!("[tool: {tool_name}]");
                }
                AgentEvent::Retry { attempt, delay_ms, .. } => {
                    println!("[retrying (attempt {attempt}) in {delay_ms}ms…]");
                }
                AgentEvent::AgentEnd => {
                    println!();
                    print_ready_line();
                }
                _ => {}
            }
        }
    });

    println!(
        "pi — session {} — model {}",
        session.session_id(),
        session.get_state().model
    );
    if let Some(text) = initial {
        session.prompt_and_wait(&text, PromptOptions::default()).await?;
    } else {
        print_ready_line();
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if session.agent().is_streaming() {
                    session.abort();
                    continue;
                }
                return Ok(130);
            }
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(0) };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if text == "/quit" || text == "/exit" {
                    return Ok(0);
                }
                if session.agent().is_streaming() {
                    // Mid-turn input steers the agent rather than failing.
                    session.steer(text);
                    continue;
                }
                if let Err(e) = session.prompt_and_wait(text, PromptOptions::default()).await {
                    eprintln!("pi: {e}");
                }
            }
        }
    }
}

fn print_ready_line() {
    print!("> ");
    let _ = std::io::stdout().flush();
}
