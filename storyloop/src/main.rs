//! Story backlog run orchestrator.
//!
//! Drives an agent through a `prd.json` backlog one story per iteration,
//! persisting every checkpoint and event under `.storyloop/` so runs can be
//! inspected, resumed and recovered.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use secrecy::SecretString;
use tracing::warn;

use storyloop::core::budget::BudgetConfig;
use storyloop::core::selector::select_next;
use storyloop::core::types::{Run, RunFilter};
use storyloop::events::{EventStream, RunEvent};
use storyloop::exit_codes;
use storyloop::io::backlog::{BacklogRef, load_backlog};
use storyloop::io::config::{OrchestratorConfig, load_config};
use storyloop::io::executor::ProcessExecutor;
use storyloop::io::source_control::GitSourceControl;
use storyloop::io::store::FileRunStore;
use storyloop::logging;
use storyloop::orchestrator::{Orchestrator, StartRunRequest};

const DEFAULT_CONFIG: &str = ".storyloop/config.toml";

#[derive(Parser)]
#[command(
    name = "storyloop",
    version,
    about = "Run an autonomous agent through a story backlog"
)]
struct Cli {
    /// Orchestrator config (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a backlog against its schema and invariants.
    Validate { backlog: PathBuf },
    /// Print the id of the next story a run would pick.
    Select { backlog: PathBuf },
    /// Start a run and stream its events as JSON lines.
    Run {
        #[arg(long)]
        backlog: PathBuf,
        #[arg(long)]
        project: String,
        #[arg(long)]
        max_iterations: u32,
        #[arg(long)]
        max_cost_usd: Option<f64>,
        #[arg(long)]
        max_wall_clock_secs: Option<f64>,
    },
    /// Resume a paused run, or pick up one interrupted by a crash.
    Resume { run_id: String },
    /// Print a run snapshot as JSON.
    Status { run_id: String },
    /// Print run summaries as JSON.
    List {
        #[arg(long)]
        project: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Validate { backlog } => cmd_validate(&backlog),
        Command::Select { backlog } => cmd_select(&backlog),
        Command::Run {
            backlog,
            project,
            max_iterations,
            max_cost_usd,
            max_wall_clock_secs,
        } => {
            let budget = BudgetConfig {
                max_iterations,
                max_cost_usd,
                max_wall_clock_seconds: max_wall_clock_secs,
            };
            cmd_run(&cli.config, backlog, project, budget).await
        }
        Command::Resume { run_id } => cmd_resume(&cli.config, &run_id).await,
        Command::Status { run_id } => {
            let orchestrator = build_orchestrator(&load_config(&cli.config)?);
            let run = orchestrator.get_run(&run_id).await?;
            print_json(&run)?;
            Ok(exit_codes::OK)
        }
        Command::List { project } => {
            let orchestrator = build_orchestrator(&load_config(&cli.config)?);
            let summaries = orchestrator
                .list_runs(project.as_deref(), &RunFilter::default())
                .await?;
            print_json(&summaries)?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let loaded = load_backlog(&BacklogRef::Path(path.to_path_buf()))?;
    let backlog = loaded.document.to_backlog();
    println!(
        "{}: {} stories, {} passed, branch {}",
        loaded.source_id,
        backlog.len(),
        backlog.passed_count(),
        loaded.document.branch_name
    );
    Ok(exit_codes::OK)
}

fn cmd_select(path: &Path) -> Result<i32> {
    let loaded = load_backlog(&BacklogRef::Path(path.to_path_buf()))?;
    let backlog = loaded.document.to_backlog();
    match select_next(&backlog) {
        Some(story) => {
            println!("{}", story.id);
            Ok(exit_codes::OK)
        }
        None => {
            eprintln!("no eligible story: every story has passed");
            Ok(exit_codes::NOTHING_SELECTED)
        }
    }
}

async fn cmd_run(
    config_path: &Path,
    backlog: PathBuf,
    project_id: String,
    budget: BudgetConfig,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let orchestrator = build_orchestrator(&config);
    let run_id = orchestrator
        .start_run(StartRunRequest {
            project_id,
            backlog: BacklogRef::Path(backlog),
            budget,
        })
        .await?;
    eprintln!("started run {run_id}");
    let events = orchestrator.subscribe_events(&run_id, 0).await?;
    let run = follow(&orchestrator, &run_id, events).await?;
    Ok(report(&run))
}

async fn cmd_resume(config_path: &Path, run_id: &str) -> Result<i32> {
    let config = load_config(config_path)?;
    let orchestrator = build_orchestrator(&config);
    let from = orchestrator.next_event_sequence(run_id).await?;
    if !orchestrator.recover_run(run_id).await? {
        orchestrator.resume_run(run_id).await?;
    }
    let events = orchestrator.subscribe_events(run_id, from).await?;
    let run = follow(&orchestrator, run_id, events).await?;
    Ok(report(&run))
}

fn build_orchestrator(config: &OrchestratorConfig) -> Orchestrator {
    let credential = std::env::var(&config.credential_env)
        .ok()
        .map(SecretString::from);
    Orchestrator::new(
        config.clone(),
        Arc::new(FileRunStore::new(&config.state_dir)),
        Arc::new(ProcessExecutor::new(&config.executor)),
        Arc::new(GitSourceControl::new(&config.source_control)),
        credential,
    )
}

/// Print events until the run settles; Ctrl-C requests cancellation.
async fn follow(orchestrator: &Orchestrator, run_id: &str, mut events: EventStream) -> Result<Run> {
    let settled = orchestrator.wait_settled(run_id);
    tokio::pin!(settled);
    let mut printed = None;
    let run = loop {
        tokio::select! {
            Some(event) = events.next() => {
                print_event(&event)?;
                printed = Some(event.sequence);
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for ctrl-c")?;
                eprintln!("cancel requested; the current iteration will finish first");
                if let Err(err) = orchestrator.cancel_run(run_id).await {
                    warn!(run_id, err = %format!("{err:#}"), "cancel rejected");
                }
            }
            run = &mut settled => break run?,
        }
    };
    let end = orchestrator.next_event_sequence(run_id).await?;
    while printed.is_none_or(|sequence| sequence + 1 < end) {
        let Some(event) = events.next().await else {
            break;
        };
        print_event(&event)?;
        printed = Some(event.sequence);
    }
    Ok(run)
}

fn print_event(event: &RunEvent) -> Result<()> {
    let line = serde_json::to_string(event).context("serialize event")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}").context("write event")?;
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

fn report(run: &Run) -> i32 {
    eprintln!(
        "run {} {}: {} iterations, ${:.2}",
        run.id, run.status, run.iterations_used, run.total_cost
    );
    if let Some(error) = &run.error {
        eprintln!("error: {error}");
    }
    exit_codes::for_status(run.status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_budget() {
        let cli = Cli::parse_from([
            "storyloop",
            "run",
            "--backlog",
            "prd.json",
            "--project",
            "shop",
            "--max-iterations",
            "5",
            "--max-cost-usd",
            "2.5",
        ]);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG));
        match cli.command {
            Command::Run {
                max_iterations,
                max_cost_usd,
                max_wall_clock_secs,
                ..
            } => {
                assert_eq!(max_iterations, 5);
                assert_eq!(max_cost_usd, Some(2.5));
                assert_eq!(max_wall_clock_secs, None);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_global_config_after_subcommand() {
        let cli = Cli::parse_from(["storyloop", "status", "abc", "--config", "cfg.toml"]);
        assert_eq!(cli.config, PathBuf::from("cfg.toml"));
        assert!(matches!(cli.command, Command::Status { ref run_id } if run_id == "abc"));
    }
}
