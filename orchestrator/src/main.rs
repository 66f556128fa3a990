//! Operator tooling over an orchestrator state directory.
//!
//! Inspects runs and effects and resolves pending breakpoints. Processes are
//! Rust code, so starting and resuming runs belongs to the embedding program.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use orchestrator::io::clock::SystemClock;
use orchestrator::io::config::{OrchestratorConfig, write_config};
use orchestrator::io::fs_store::{FsJournal, FsRunStore};
use orchestrator::io::journal::EffectJournal;
use orchestrator::io::paths::StatePaths;
use orchestrator::io::run_store::RunStore;
use orchestrator::{
    BreakpointController, EffectId, OrchestratorError, ResolveOutcome, Result, RunId, exit_codes,
    logging,
};

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Inspect durable runs and resolve their breakpoints"
)]
struct Cli {
    /// State directory holding `config.toml` and `runs/`.
    #[arg(long, global = true, default_value = ".orchestrator")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the state directory and a default `config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Print a run record as JSON.
    Status { run_id: String },
    /// List runs, one per line.
    Runs,
    /// List the journaled effects of a run.
    Effects { run_id: String },
    /// List unresolved breakpoints.
    Breakpoints {
        /// Only breakpoints of this run.
        #[arg(long)]
        run: Option<String>,
    },
    /// Print one breakpoint, pending or resolved, as JSON.
    Breakpoint {
        run_id: String,
        breakpoint_id: String,
    },
    /// Record a decision for a pending breakpoint. Does not resume the run.
    Resolve {
        run_id: String,
        breakpoint_id: String,
        /// Resolution as a JSON value.
        #[arg(long)]
        json: String,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("{err:#}");
        std::process::exit(exit_codes::for_error(&err));
    }
}

fn run(cli: Cli) -> Result<()> {
    let state_dir = cli.state_dir.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(state_dir, force),
        Command::Status { run_id } => cmd_status(state_dir, &RunId::new(run_id)),
        Command::Runs => cmd_runs(state_dir),
        Command::Effects { run_id } => cmd_effects(state_dir, &RunId::new(run_id)),
        Command::Breakpoints { run } => cmd_breakpoints(state_dir, run.map(RunId::new).as_ref()),
        Command::Breakpoint {
            run_id,
            breakpoint_id,
        } => cmd_breakpoint(state_dir, &RunId::new(run_id), &breakpoint_id),
        Command::Resolve {
            run_id,
            breakpoint_id,
            json,
        } => cmd_resolve(state_dir, &RunId::new(run_id), &breakpoint_id, &json),
    }
}

fn cmd_init(state_dir: &Path, force: bool) -> Result<()> {
    let paths = StatePaths::new(state_dir);
    fs::create_dir_all(&paths.runs_dir)
        .with_context(|| format!("create directory {}", paths.runs_dir.display()))?;
    if force || !paths.config_path.exists() {
        write_config(&paths.config_path, &OrchestratorConfig::default())?;
    }
    println!("{}", paths.root.display());
    Ok(())
}

fn cmd_status(state_dir: &Path, run_id: &RunId) -> Result<()> {
    let runs = FsRunStore::open(state_dir)?;
    let run = runs
        .load(run_id)?
        .ok_or_else(|| OrchestratorError::RunNotFound(run_id.clone()))?;
    print_json(&run)
}

fn cmd_runs(state_dir: &Path) -> Result<()> {
    let runs = FsRunStore::open(state_dir)?;
    for run in runs.list()? {
        println!(
            "{}\t{}\t{}\t{}",
            run.run_id,
            run.process_id,
            run.status,
            run.updated_at.to_rfc3339()
        );
    }
    Ok(())
}

fn cmd_effects(state_dir: &Path, run_id: &RunId) -> Result<()> {
    let runs = FsRunStore::open(state_dir)?;
    if runs.load(run_id)?.is_none() {
        return Err(OrchestratorError::RunNotFound(run_id.clone()));
    }
    let journal = FsJournal::open(state_dir)?;
    for record in journal.list(run_id)? {
        println!(
            "{}\t{}\t{}\t{}",
            record.effect_id,
            record.kind.label(),
            record.status,
            record.attempts
        );
    }
    Ok(())
}

fn cmd_breakpoints(state_dir: &Path, run_id: Option<&RunId>) -> Result<()> {
    let journal = FsJournal::open(state_dir)?;
    let runs = FsRunStore::open(state_dir)?;
    let controller = BreakpointController::new(&journal, &runs, &SystemClock);
    for breakpoint in controller.list_pending(run_id)? {
        println!(
            "{}\t{}\t{}",
            breakpoint.run_id, breakpoint.breakpoint_id, breakpoint.question
        );
    }
    Ok(())
}

fn cmd_breakpoint(state_dir: &Path, run_id: &RunId, breakpoint_id: &str) -> Result<()> {
    let breakpoint_id = parse_effect_id(breakpoint_id)?;
    let journal = FsJournal::open(state_dir)?;
    let runs = FsRunStore::open(state_dir)?;
    let controller = BreakpointController::new(&journal, &runs, &SystemClock);
    print_json(&controller.get(run_id, &breakpoint_id)?)
}

fn cmd_resolve(state_dir: &Path, run_id: &RunId, breakpoint_id: &str, raw: &str) -> Result<()> {
    let breakpoint_id = parse_effect_id(breakpoint_id)?;
    let resolution: Value = serde_json::from_str(raw)
        .map_err(|err| OrchestratorError::InvalidState(format!("--json is not valid JSON: {err}")))?;

    let journal = FsJournal::open(state_dir)?;
    let runs = FsRunStore::open(state_dir)?;
    let controller = BreakpointController::new(&journal, &runs, &SystemClock);
    match controller.resolve(run_id, &breakpoint_id, resolution)? {
        ResolveOutcome::Resolved => println!("resolved {run_id} {breakpoint_id}"),
        ResolveOutcome::AlreadyResolved => println!("already resolved {run_id} {breakpoint_id}"),
    }
    Ok(())
}

fn parse_effect_id(raw: &str) -> Result<EffectId> {
    EffectId::parse(raw)
        .ok_or_else(|| OrchestratorError::InvalidState(format!("'{raw}' is not an effect id")))
}

/// Print `value` as pretty JSON with a trailing newline.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resolve_with_json() {
        let cli = Cli::parse_from([
            "orchestrator",
            "--state-dir",
            "/tmp/state",
            "resolve",
            "run-1",
            "ef-000002",
            "--json",
            r#"{"approved":true}"#,
        ]);
        assert_eq!(cli.state_dir, PathBuf::from("/tmp/state"));
        let Command::Resolve {
            run_id,
            breakpoint_id,
            json,
        } = cli.command
        else {
            panic!("expected resolve");
        };
        assert_eq!(run_id, "run-1");
        assert_eq!(breakpoint_id, "ef-000002");
        assert_eq!(json, r#"{"approved":true}"#);
    }

    #[test]
    fn parses_breakpoint_lookup() {
        let cli = Cli::parse_from(["orchestrator", "breakpoint", "run-1", "ef-000003"]);
        assert!(matches!(
            cli.command,
            Command::Breakpoint { ref run_id, ref breakpoint_id }
                if run_id == "run-1" && breakpoint_id == "ef-000003"
        ));
        assert!(parse_effect_id("three").is_err());
    }

    #[test]
    fn state_dir_defaults_and_is_global() {
        let cli = Cli::parse_from(["orchestrator", "breakpoints", "--run", "run-1"]);
        assert_eq!(cli.state_dir, PathBuf::from(".orchestrator"));
        assert!(matches!(cli.command, Command::Breakpoints { run: Some(ref run) } if run == "run-1"));

        let cli = Cli::parse_from(["orchestrator", "runs", "--state-dir", "elsewhere"]);
        assert_eq!(cli.state_dir, PathBuf::from("elsewhere"));
    }

    #[test]
    fn init_writes_default_config_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state_dir = temp.path().join("state");
        cmd_init(&state_dir, false).expect("init");
        let config_path = state_dir.join("config.toml");
        assert!(config_path.is_file());
        assert!(state_dir.join("runs").is_dir());

        fs::write(&config_path, "[retry]\nmax_attempts = 9\n").expect("edit");
        cmd_init(&state_dir, false).expect("init again");
        let raw = fs::read_to_string(&config_path).expect("read");
        assert!(raw.contains("max_attempts = 9"));

        cmd_init(&state_dir, true).expect("force");
        let raw = fs::read_to_string(&config_path).expect("read");
        assert!(raw.contains("max_attempts = 3"));
    }
}
