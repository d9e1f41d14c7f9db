//! CLI entry point for Duet.
//!
//! This binary provides the `duet` command: it wires the built-in tools, the
//! Anthropic client and the orchestrator together, renders progress on the
//! console, and turns Ctrl-C into an operator pause.

mod cli;
mod operator;
mod render;
mod tools;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use duet_agent::llm::client::ANTHROPIC_BASE_URL;
use duet_agent::orchestrator::ACTOR_PROMPT;
use duet_agent::{
    AgentRole, DuetConfig, LlmClient, LlmClientConfig, ModelRegistry, Orchestrator,
    OrchestratorEvent, PauseHandle, RunOutcome, TranscriptWriter,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::operator::OperatorCommand;
use crate::render::Console;
use crate::tools::Workspace;

/// Exit code when the round ceiling is reached without `DONE`.
const EXIT_ROUND_LIMIT: u8 = 2;
/// Exit code when the operator aborts during a pause.
const EXIT_ABORTED: u8 = 130;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(if cli.verbose { "debug" } else { "warn" });

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "duet failed");
            eprintln!("duet: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let mut config = DuetConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    config
        .apply_env()
        .context("invalid DUET_* environment override")?;
    cli.apply_to(&mut config);

    let workspace = Workspace::new(&cli.workdir)
        .with_context(|| format!("working directory {} not found", cli.workdir.display()))?;
    if config.actor.system_prompt.is_none() {
        config.actor.system_prompt = Some(format!(
            "{ACTOR_PROMPT}\n\nYour working directory is {}.  File paths are relative to it.",
            workspace.root().display()
        ));
    }

    let registry = tools::builtin_registry(&workspace).context("failed to register tools")?;

    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
    let base_url =
        std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| ANTHROPIC_BASE_URL.to_owned());
    let client = LlmClient::new(
        LlmClientConfig::anthropic(api_key, config.director.model.clone()).with_base_url(base_url),
    )
    .context("set ANTHROPIC_API_KEY to an API key or OAuth token")?;

    let mut models = ModelRegistry::with_fallbacks();
    if let Err(e) = models.refresh(&client).await {
        warn!(error = %e, "could not list models, using built-in model table");
    }

    let console = Console::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut orchestrator = Orchestrator::new(Arc::new(client), Arc::new(registry), models, &config)
        .context("invalid configuration")?
        .with_events(events_tx)
        .with_sinks(AgentRole::Director, console.sinks(AgentRole::Director))
        .with_sinks(AgentRole::Actor, console.sinks(AgentRole::Actor));

    if let Some(path) = &cli.transcript {
        let writer = TranscriptWriter::open(path)
            .await
            .with_context(|| format!("failed to open transcript {}", path.display()))?;
        orchestrator = orchestrator.with_transcript(writer);
    }

    let printer = tokio::spawn(print_events(events_rx, console.clone()));
    spawn_interrupt_handler(orchestrator.pause_handle());

    info!(
        workdir = %workspace.root().display(),
        director = %orchestrator.director().model(),
        actor = %orchestrator.actor().model(),
        "starting"
    );
    eprintln!(
        "duet v{} -- director {} / actor {} -- Ctrl-C to pause",
        env!("CARGO_PKG_VERSION"),
        orchestrator.director().model(),
        orchestrator.actor().model()
    );

    let result = drive(&mut orchestrator, cli.task()).await;
    let tokens = orchestrator.tokens();

    // Dropping the orchestrator closes the event channel so the printer drains.
    drop(orchestrator);
    let _ = printer.await;
    console.end_turn();

    let code = result?;
    eprintln!(
        "tokens: director ~{} / actor ~{}",
        tokens.director, tokens.actor
    );
    Ok(code)
}

/// Run the task, handling operator pauses until it ends.
async fn drive(orchestrator: &mut Orchestrator, task: String) -> Result<ExitCode> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut outcome = orchestrator.run(task).await;

    loop {
        match outcome.context("orchestration failed")? {
            RunOutcome::Finished { rounds, summary } => {
                println!();
                if !summary.trim().is_empty() {
                    println!("{}", summary.trim());
                }
                info!(rounds, "task finished");
                return Ok(ExitCode::SUCCESS);
            }
            RunOutcome::RoundLimit { rounds } => {
                warn!(rounds, "round limit reached");
                return Ok(ExitCode::from(EXIT_ROUND_LIMIT));
            }
            RunOutcome::Paused { role } => {
                eprintln!(
                    "\npaused during {role} turn.  Type an instruction to continue, or /help."
                );
                let Some(instruction) = operator_prompt(orchestrator, &mut stdin).await? else {
                    return Ok(ExitCode::from(EXIT_ABORTED));
                };
                outcome = orchestrator.resume(&instruction).await;
            }
        }
    }
}

/// Read operator commands until one resumes the run.  `None` means abort.
async fn operator_prompt(
    orchestrator: &mut Orchestrator,
    stdin: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
) -> Result<Option<String>> {
    loop {
        eprint!("> ");
        let Some(line) = stdin
            .next_line()
            .await
            .context("failed to read operator input")?
        else {
            return Ok(None);
        };

        match OperatorCommand::parse(&line) {
            OperatorCommand::Resume(instruction) => return Ok(Some(instruction)),
            OperatorCommand::Abort => return Ok(None),
            OperatorCommand::Grant(tool) => {
                if let Err(e) = orchestrator.grant_actor_tool(&tool) {
                    eprintln!("  {e}");
                }
            }
            OperatorCommand::Revoke(tool) => {
                if let Err(e) = orchestrator.revoke_actor_tool(&tool) {
                    eprintln!("  {e}");
                }
            }
            OperatorCommand::ResetActor => {
                orchestrator.reset_actor();
                eprintln!("  actor history cleared");
            }
            OperatorCommand::Status => {
                let tokens = orchestrator.tokens();
                eprintln!(
                    "  round {} / director ~{} tokens / actor ~{} tokens",
                    orchestrator.round(),
                    tokens.director,
                    tokens.actor
                );
                let allowed: Vec<&str> = orchestrator
                    .actor()
                    .effective_permissions()
                    .allowed()
                    .collect();
                eprintln!("  actor tools: {}", allowed.join(", "));
            }
            OperatorCommand::Help => eprintln!("{}", operator::HELP),
            OperatorCommand::Unknown(cmd) => eprintln!("  unknown command `{cmd}`, try /help"),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// First Ctrl-C pauses the run; another while paused exits.
fn spawn_interrupt_handler(pause: PauseHandle) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if pause.is_paused() {
                eprintln!("\n  aborted.");
                std::process::exit(i32::from(EXIT_ABORTED));
            }
            pause.pause();
        }
    });
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<OrchestratorEvent>, console: Console) {
    while let Some(event) = rx.recv().await {
        if matches!(event, OrchestratorEvent::TurnCompleted { .. }) {
            console.end_turn();
        }
        if let Some(line) = render::status_line(&event) {
            eprintln!("{line}");
        }
    }
}
