//! Local governance layer around a chat model.
//!
//! `steward implement` turns one instruction into staged, reviewed changes
//! with a full audit trail under `ledger/` and `sessions/`.

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use steward::core::execution::ExecutionOutcome;
use steward::core::state::TerminalStatus;
use steward::exit_codes;
use steward::implement::{ApplyResult, ImplementOptions, ImplementOutcome, run_implement};
use steward::io::context::ContextScope;
use steward::io::editor::InstructionSource;
use steward::io::git::Git;
use steward::io::init::{init_project, open_project};
use steward::io::model::CommandModelClient;
use steward::io::review::{AutoApprove, ConsoleReviewer, Reviewer};
use steward::io::transcript::Transcript;
use steward::logging;
use steward::report::{Timeframe, aggregate_usage, render};
use steward::session::Session;

#[derive(Parser)]
#[command(
    name = "steward",
    version,
    about = "Governed, audited model-driven changes to a local project"
)]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.steward/config.toml`, the ledgers and the sandbox root.
    Init {
        /// Overwrite the existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one instruction through the model, review and apply the result.
    Implement {
        /// Instruction text (otherwise opens $VISUAL/$EDITOR).
        #[arg(short = 'm', long = "message", conflicts_with = "instruction_file")]
        message: Option<String>,
        /// Read the instruction from a file.
        #[arg(long)]
        instruction_file: Option<PathBuf>,
        /// Attach a file to this instruction only (repeatable).
        #[arg(short = 'f', long = "file")]
        files: Vec<PathBuf>,
        /// Which project files feed the context pack.
        #[arg(long, value_enum, default_value_t = ContextScope::Full)]
        scope: ContextScope,
        /// Approve every staged file without asking.
        #[arg(short, long)]
        yes: bool,
        /// Skip the git commit after apply.
        #[arg(long)]
        no_commit: bool,
    },
    /// Run one script from the sandbox root and print its record.
    Exec {
        script: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Show uncommitted changes and the last commit.
    Status,
    /// Write a manifest for a fresh session and print its path.
    Manifest,
    /// Summarize token usage and estimated cost.
    Report {
        /// Only transactions from today (UTC).
        #[arg(long)]
        today: bool,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.root;
    match cli.command {
        Command::Init { force } => {
            let paths = init_project(&root, force)?;
            println!("initialized {}", paths.steward_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Implement {
            message,
            instruction_file,
            files,
            scope,
            yes,
            no_commit,
        } => {
            let source = match (message, instruction_file) {
                (Some(text), _) => InstructionSource::Message(text),
                (None, Some(path)) => InstructionSource::File(path),
                (None, None) => InstructionSource::Editor,
            };
            let options = ImplementOptions {
                source,
                attachments: files,
                scope,
                commit: !no_commit,
            };
            let mut session = Session::open(&root, true)?;
            let client = CommandModelClient::new(&session.config.model);
            let stdin = io::stdin();
            let mut console;
            let mut auto;
            let reviewer: &mut dyn Reviewer = if yes {
                auto = AutoApprove;
                &mut auto
            } else {
                console = ConsoleReviewer::new(stdin.lock());
                &mut console
            };
            let outcome = run_implement(&mut session, &client, reviewer, &options)?;
            Ok(implement_exit_code(&outcome))
        }
        Command::Exec { script, args } => {
            let session = Session::open(&root, true)?;
            let outcome = session
                .sandbox
                .execute(&script, &args, None, &session.recorder)?;
            report_execution(&outcome, session.recorder.transcript())
        }
        Command::Manifest => {
            let mut session = Session::open(&root, false)?;
            match session.write_manifest()? {
                Some(path) => {
                    println!("{}", path.display());
                    Ok(exit_codes::OK)
                }
                None => {
                    eprintln!("manifest could not be written; see ledger/events.jsonl");
                    Ok(exit_codes::INVALID)
                }
            }
        }
        Command::Status => {
            open_project(&root)?;
            let git = Git::new(&root);
            if !git.is_repo() {
                println!("not a git repository");
                return Ok(exit_codes::OK);
            }
            let changes = git.short_status()?;
            if changes.trim().is_empty() {
                println!("working tree clean");
            } else {
                print!("{changes}");
            }
            match git.last_commit()? {
                Some(commit) => println!("last commit: {commit}"),
                None => println!("no commits yet"),
            }
            Ok(exit_codes::OK)
        }
        Command::Report { today } => {
            let (paths, config) = open_project(&root)?;
            let (timeframe, title) = if today {
                (Timeframe::Today, "Usage today (UTC)")
            } else {
                (Timeframe::All, "Usage, all time")
            };
            let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
            let report = aggregate_usage(&paths.audit_log_path, timeframe, &date, &config.pricing)?;
            print!("{}", render(&report, title));
            Ok(exit_codes::OK)
        }
    }
}

fn implement_exit_code(outcome: &ImplementOutcome) -> i32 {
    match outcome.rebound.status {
        TerminalStatus::Cancelled => exit_codes::CANCELLED,
        TerminalStatus::LoopLimitExceeded => exit_codes::LOOP_LIMIT,
        TerminalStatus::MalformedResponse | TerminalStatus::ModelFailure => {
            exit_codes::NOT_APPLIED
        }
        TerminalStatus::Completed => match &outcome.apply {
            ApplyResult::Applied(_) | ApplyResult::NothingToApply => exit_codes::OK,
            ApplyResult::Discarded(_) | ApplyResult::NotAttempted => exit_codes::NOT_APPLIED,
        },
    }
}

fn report_execution(outcome: &ExecutionOutcome, transcript: &Transcript) -> Result<i32> {
    let Some(record) = outcome.record() else {
        if let ExecutionOutcome::Blocked(reason) = outcome {
            transcript.error(&format!("blocked ({}): {}", reason.code(), reason))?;
        }
        return Ok(exit_codes::EXECUTION_BLOCKED);
    };
    transcript.wrapper(&format!(
        "{} {:?} exit={} {}ms{}",
        record.script,
        record.status,
        record.reported_exit_code(),
        record.duration_ms,
        if record.truncated { " (truncated)" } else { "" }
    ))?;
    if !record.stdout.is_empty() {
        transcript.raw(&format!("--- stdout ---\n{}\n", record.stdout.trim_end()))?;
    }
    if !record.stderr.is_empty() {
        transcript.raw(&format!("--- stderr ---\n{}\n", record.stderr.trim_end()))?;
    }
    Ok(match outcome {
        ExecutionOutcome::Completed(_) => exit_codes::OK,
        _ => exit_codes::INVALID,
    })
}
