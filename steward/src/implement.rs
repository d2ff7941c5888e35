//! `steward implement`: instruction in, reviewed and committed files out.
//!
//! Order of operations: attachments are read first (an unreadable one aborts
//! before anything is logged), the instruction is captured and echoed to the
//! transcript, the Rebound loop runs, and only a `Completed` step with staged
//! files reaches review, apply and commit. A transaction record closes every
//! step that was not cancelled.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, warn};

use crate::core::path::display_slash;
use crate::core::state::TerminalStatus;
use crate::core::types::{ActionKind, Actor, TransactionStatus};
use crate::io::audit::{LedgerEvent, Transaction};
use crate::io::context::{ContextScope, read_attachments};
use crate::io::editor::{InstructionSource, read_instruction};
use crate::io::git::{Git, commit_message};
use crate::io::model::ModelClient;
use crate::io::review::{ReviewDecision, Reviewer, apply_atomically, collect_staged, review_step};
use crate::rebound::{ReboundOutcome, ReboundRequest, run_rebound};
use crate::report::estimate_cost;
use crate::session::Session;

#[derive(Debug, Clone)]
pub struct ImplementOptions {
    pub source: InstructionSource,
    pub attachments: Vec<PathBuf>,
    pub scope: ContextScope,
    /// Commit (and optionally push) after a successful apply.
    pub commit: bool,
}

/// What happened to the step's staged files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyResult {
    /// The loop did not complete normally; nothing was offered for review.
    NotAttempted,
    NothingToApply,
    Applied(Vec<PathBuf>),
    Discarded(String),
}

#[derive(Debug, Clone)]
pub struct ImplementOutcome {
    pub rebound: ReboundOutcome,
    pub apply: ApplyResult,
    pub committed: bool,
    pub transaction: Option<TransactionStatus>,
    pub manifest: Option<PathBuf>,
}

pub fn run_implement<C: ModelClient + ?Sized>(
    session: &mut Session,
    client: &C,
    reviewer: &mut dyn Reviewer,
    options: &ImplementOptions,
) -> Result<ImplementOutcome> {
    let attachments = read_attachments(&session.paths.root, &options.attachments)?;
    let instruction = read_instruction(&options.source, &session.paths.root)?;
    session.recorder.transcript().user(&instruction)?;

    let rebound = run_rebound(
        session,
        client,
        &ReboundRequest {
            instruction: &instruction,
            attachments: &attachments,
            scope: options.scope,
        },
    )?;
    if rebound.status == TerminalStatus::Cancelled {
        return Ok(ImplementOutcome {
            rebound,
            apply: ApplyResult::NotAttempted,
            committed: false,
            transaction: None,
            manifest: None,
        });
    }

    let apply = if rebound.status == TerminalStatus::Completed {
        review_and_apply(session, reviewer, &rebound)?
    } else {
        if !rebound.artifacts.is_empty() {
            session.recorder.log_event(
                LedgerEvent::new(Actor::Orchestrator, ActionKind::ArtifactsDiscarded)
                    .artifacts(rebound.artifacts.iter().map(|a| a.staged_ref.clone()))
                    .step(&rebound.step_id)
                    .detail(format!("loop ended with {:?}", rebound.status)),
            )?;
        }
        ApplyResult::NotAttempted
    };

    let committed = match &apply {
        ApplyResult::Applied(_) if options.commit => commit(session, &instruction)?,
        _ => false,
    };

    let status = match (&rebound.status, &apply) {
        (TerminalStatus::Completed, ApplyResult::Applied(_) | ApplyResult::NothingToApply) => {
            TransactionStatus::Success
        }
        _ => TransactionStatus::Failure,
    };
    session.recorder.log_transaction(&Transaction::new(
        &session.id,
        &rebound.step_id,
        &instruction,
        rebound.usage,
        status,
    ))?;

    let manifest = session.write_manifest()?;
    let cost = estimate_cost(rebound.usage, &session.config.pricing);
    session.recorder.transcript().wrapper(&format!(
        "Step {} {:?} after {} turn(s); tokens in={} out={} total={}; est. cost {:.4}",
        rebound.step_id,
        rebound.status,
        rebound.iterations,
        rebound.usage.input_tokens,
        rebound.usage.output_tokens,
        rebound.usage.total_tokens,
        cost
    ))?;
    info!(step = %rebound.step_id, ?status, "implement finished");

    Ok(ImplementOutcome {
        rebound,
        apply,
        committed,
        transaction: Some(status),
        manifest,
    })
}

fn review_and_apply(
    session: &Session,
    reviewer: &mut dyn Reviewer,
    rebound: &ReboundOutcome,
) -> Result<ApplyResult> {
    let step_dir = session.store.step_dir(&rebound.step_id);
    let files = collect_staged(&step_dir, &session.paths.root)?;
    if files.is_empty() {
        return Ok(ApplyResult::NothingToApply);
    }

    let transcript = session.recorder.transcript();
    let reason = match review_step(&files, reviewer, transcript)? {
        ReviewDecision::Approved => match apply_atomically(&files) {
            Ok(applied) => {
                session.recorder.log_event(
                    LedgerEvent::new(Actor::Operator, ActionKind::ArtifactsApplied)
                        .artifacts(applied.iter().map(|rel| display_slash(rel)))
                        .step(&rebound.step_id),
                )?;
                transcript.wrapper(&format!("Applied {} file(s).", applied.len()))?;
                return Ok(ApplyResult::Applied(applied));
            }
            Err(err) => {
                warn!(err = %err, "apply failed, nothing merged");
                transcript.error(&format!("Apply failed, nothing merged: {err:#}"))?;
                format!("apply failed: {err:#}")
            }
        },
        ReviewDecision::Rejected(path) => format!("rejected {path}"),
        ReviewDecision::Aborted => "aborted by operator".to_string(),
    };

    session.recorder.log_event(
        LedgerEvent::new(Actor::Operator, ActionKind::ArtifactsDiscarded)
            .artifacts(files.iter().map(|file| display_slash(&file.rel)))
            .step(&rebound.step_id)
            .detail(reason.clone()),
    )?;
    transcript.wrapper(&format!("Step discarded ({reason}). Staged files kept for audit."))?;
    Ok(ApplyResult::Discarded(reason))
}

/// Commit the merged files. Git problems are reported, never rolled back.
fn commit(session: &Session, instruction: &str) -> Result<bool> {
    let transcript = session.recorder.transcript();
    let git = Git::new(&session.paths.root);
    if !git.is_repo() {
        transcript.wrapper("Not a git repository, skipping commit.")?;
        return Ok(false);
    }
    let committed = git
        .add_all()
        .and_then(|()| git.commit_staged(&commit_message(instruction)));
    let committed = match committed {
        Ok(committed) => committed,
        Err(err) => {
            transcript.error(&format!("git commit failed: {err:#}"))?;
            return Ok(false);
        }
    };
    if !committed {
        transcript.wrapper("Nothing to commit.")?;
        return Ok(false);
    }
    transcript.wrapper("Committed.")?;
    if session.config.git.push {
        match git.push() {
            Ok(()) => transcript.wrapper("Pushed.")?,
            Err(err) => transcript.error(&format!("git push failed: {err:#}"))?,
        }
    }
    Ok(true)
}
