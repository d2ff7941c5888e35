//! The Rebound loop: bounded chaining of model calls with sandboxed script
//! execution.
//!
//! One call to [`run_rebound`] is one Step. The loop is an explicit state
//! machine ([`crate::core::state`]) driven by a plain `loop`; the iteration
//! counter lives in the state, so the bound does not depend on the model
//! ever dropping its `next_action`.
//!
//! Nothing here touches the versioned tree. Artifacts are staged under the
//! step directory and only the caller may merge them, and only after the
//! loop reached `Terminal`.

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::execution::{BlockReason, ExecutionRecord};
use crate::core::ids::{StepId, new_record_id};
use crate::core::response::{
    NextAction, NextActionDirective, ParseOutcome, ParsedResponse, parse_response,
};
use crate::core::state::{ReboundEvent, ReboundState, TerminalStatus, transition};
use crate::core::types::{ActionKind, Actor, TokenUsage};
use crate::io::audit::{Exchange, LedgerEvent, timestamp_utc};
use crate::io::content_store::Artifact;
use crate::io::context::{ContextScope, build_context_pack};
use crate::io::model::{ModelClient, ModelRequest};
use crate::io::prompt::Attachment;
use crate::io::sandbox::ResolvedScript;
use crate::session::Session;

/// Input for one Step.
#[derive(Debug, Clone)]
pub struct ReboundRequest<'a> {
    pub instruction: &'a str,
    pub attachments: &'a [Attachment],
    pub scope: ContextScope,
}

/// A script run requested by the model, tied to the turn that asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainedExecution {
    pub iteration: u32,
    pub action: NextAction,
    pub record: ExecutionRecord,
}

#[derive(Debug, Clone)]
pub struct ReboundOutcome {
    pub step_id: StepId,
    pub status: TerminalStatus,
    /// Model turns started.
    pub iterations: u32,
    /// Raw content of the most recent reply, kept even when the loop was cut
    /// short.
    pub final_response: Option<String>,
    pub thought_process: Option<String>,
    pub artifacts: Vec<Artifact>,
    pub executions: Vec<ChainedExecution>,
    pub usage: TokenUsage,
    pub exchange_ids: Vec<String>,
    pub error: Option<String>,
}

impl ReboundOutcome {
    fn new(step_id: StepId) -> Self {
        Self {
            step_id,
            status: TerminalStatus::Cancelled,
            iterations: 0,
            final_response: None,
            thought_process: None,
            artifacts: Vec::new(),
            executions: Vec::new(),
            usage: TokenUsage::default(),
            exchange_ids: Vec::new(),
            error: None,
        }
    }
}

/// Run one Step to a terminal state.
///
/// Errors are reserved for audit-trail failures and internal faults; model,
/// parse and script problems end up in [`ReboundOutcome::status`].
#[instrument(skip_all, fields(session = %session.id))]
pub fn run_rebound<C: ModelClient + ?Sized>(
    session: &mut Session,
    client: &C,
    request: &ReboundRequest<'_>,
) -> Result<ReboundOutcome> {
    let step = StepId::generate();
    let max_loops = session.config.max_loops;
    let mut outcome = ReboundOutcome::new(step.clone());

    let empty = request.instruction.trim().is_empty();
    let mut state = transition(
        ReboundState::AwaitingInstruction,
        ReboundEvent::Instruction { empty },
        max_loops,
    )?;
    if empty {
        info!(step = %step, "empty instruction, cancelled");
        session.recorder.log_event(
            LedgerEvent::new(Actor::Operator, ActionKind::Cancellation)
                .step(&step)
                .detail("empty instruction"),
        )?;
        session
            .recorder
            .transcript()
            .wrapper("Empty instruction. Nothing was sent to the model.")?;
        return Ok(outcome);
    }

    session.recorder.log_event(
        LedgerEvent::new(Actor::Operator, ActionKind::InstructionReceived)
            .step(&step)
            .detail(format!("{} bytes", request.instruction.len())),
    )?;

    let system = session.prompts.render_system(&session.sandbox_brief())?;
    let context = build_context_pack(
        &session.paths.root,
        &session.config.context,
        request.scope,
        &session.excluded_dirs(),
    )?;
    if !context.omitted.is_empty() {
        session.recorder.transcript().wrapper(&format!(
            "Context: {} files included, {} omitted ({})",
            context.included.len(),
            context.omitted.len(),
            context.omitted.join(", ")
        ))?;
    }
    let mut prompt =
        session
            .prompts
            .render_user(request.instruction, request.attachments, &context.text)?;

    let mut reply: Option<(String, Option<String>)> = None;
    let mut pending: Option<(NextAction, ResolvedScript)> = None;

    loop {
        debug!(?state, "rebound state");
        state = match state {
            ReboundState::AwaitingInstruction => {
                return Err(anyhow!("rebound loop re-entered AwaitingInstruction"));
            }
            ReboundState::CallingModel { iteration } => {
                outcome.iterations = iteration;
                let event = call_model(
                    session,
                    client,
                    &step,
                    iteration,
                    &system,
                    &prompt,
                    &mut outcome,
                    &mut reply,
                )?;
                transition(state, event, max_loops)?
            }
            ReboundState::ApplyingArtifacts { iteration } => {
                let (content, exchange_ref) = reply
                    .take()
                    .ok_or_else(|| anyhow!("no model reply to apply"))?;
                outcome.final_response = Some(content.clone());
                let event = match parse_response(&content) {
                    ParseOutcome::Malformed(err) => {
                        warn!(err = %err, "malformed model response");
                        session.recorder.log_event(
                            LedgerEvent::new(Actor::Model, ActionKind::MalformedResponse)
                                .exchange(exchange_ref.as_deref())
                                .step(&step)
                                .detail(err.to_string()),
                        )?;
                        session
                            .recorder
                            .transcript()
                            .error(&format!("Malformed response: {err}"))?;
                        outcome.error = Some(err.to_string());
                        ReboundEvent::Malformed
                    }
                    ParseOutcome::Parsed(parsed) => {
                        pending = apply_parsed(
                            session,
                            &step,
                            iteration,
                            exchange_ref.as_deref(),
                            parsed,
                            &mut outcome,
                        )?;
                        ReboundEvent::Parsed {
                            action_ready: pending.is_some(),
                        }
                    }
                };
                transition(state, event, max_loops)?
            }
            ReboundState::ExecutingAction { iteration } => {
                let (action, script) = pending
                    .take()
                    .ok_or_else(|| anyhow!("no authorized next action to execute"))?;
                session
                    .recorder
                    .transcript()
                    .wrapper(&format!("Running {} (turn {iteration})", script.display))?;
                let record = session
                    .sandbox
                    .run(&script, &[], Some(&step), &session.recorder)?
                    .into_record()
                    .map_err(|reason| anyhow!("authorized script was blocked: {reason}"))?;
                session.recorder.transcript().wrapper(&format!(
                    "{} finished: {:?}, exit code {}, {} ms",
                    record.script,
                    record.status,
                    record.reported_exit_code(),
                    record.duration_ms
                ))?;
                prompt = session.prompts.render_continuation(
                    request.instruction,
                    &action.continuation,
                    &record,
                    iteration,
                    max_loops,
                )?;
                outcome.executions.push(ChainedExecution {
                    iteration,
                    action,
                    record,
                });
                transition(state, ReboundEvent::ActionExecuted, max_loops)?
            }
            ReboundState::Terminal(status) => {
                outcome.status = status;
                break;
            }
        };
    }

    if outcome.status == TerminalStatus::LoopLimitExceeded {
        warn!(max_loops, "rebound loop limit exceeded");
        session.recorder.log_event(
            LedgerEvent::new(Actor::Orchestrator, ActionKind::LoopLimitExceeded)
                .step(&step)
                .detail(format!("stopped after {max_loops} turns")),
        )?;
        session.recorder.transcript().error(&format!(
            "Loop limit of {max_loops} turns reached. Returning the last response."
        ))?;
    }
    info!(step = %step, status = ?outcome.status, iterations = outcome.iterations, "rebound finished");
    Ok(outcome)
}

/// One model turn. Returns the event to feed the state machine.
#[allow(clippy::too_many_arguments)]
fn call_model<C: ModelClient + ?Sized>(
    session: &Session,
    client: &C,
    step: &StepId,
    iteration: u32,
    system: &str,
    prompt: &str,
    outcome: &mut ReboundOutcome,
    reply: &mut Option<(String, Option<String>)>,
) -> Result<ReboundEvent> {
    let request = ModelRequest {
        model: session.config.model.alias.clone(),
        system: system.to_string(),
        user: prompt.to_string(),
    };
    session.recorder.log_event(
        LedgerEvent::new(Actor::Orchestrator, ActionKind::ApiRequest)
            .step(step)
            .detail(format!("turn {iteration}, {} bytes", prompt.len())),
    )?;
    session.recorder.transcript().prompt(&format!(
        "Turn {iteration}/{}: calling {}",
        session.config.max_loops, request.model
    ))?;

    match client.complete(&request) {
        Ok(model_reply) => {
            outcome.usage.accumulate(model_reply.usage);
            let exchange = Exchange {
                exchange_id: new_record_id(),
                timestamp_utc: timestamp_utc(),
                session_id: session.id.to_string(),
                step_id: step.to_string(),
                iteration,
                request: serde_json::to_value(&request)?,
                response: model_reply.content.clone(),
                usage: model_reply.usage,
            };
            let exchange_ref = session.recorder.record_exchange(&exchange)?;
            if let Some(id) = &exchange_ref {
                outcome.exchange_ids.push(id.clone());
            }
            session.recorder.log_event(
                LedgerEvent::new(Actor::Model, ActionKind::ApiResponse)
                    .exchange(exchange_ref.as_deref())
                    .step(step)
                    .detail(format!(
                        "tokens in={} out={}",
                        model_reply.usage.input_tokens, model_reply.usage.output_tokens
                    )),
            )?;
            *reply = Some((model_reply.content, exchange_ref));
            Ok(ReboundEvent::ModelReplied)
        }
        Err(err) => {
            warn!(err = %err, "model call failed");
            session.recorder.log_event(
                LedgerEvent::new(Actor::Orchestrator, ActionKind::ApiFailure)
                    .step(step)
                    .detail(format!("{err:#}")),
            )?;
            session
                .recorder
                .transcript()
                .error(&format!("Model call failed: {err:#}"))?;
            outcome.error = Some(format!("{err:#}"));
            Ok(ReboundEvent::ModelFailed)
        }
    }
}

/// Stage accepted artifacts and decide whether the next action may run.
fn apply_parsed(
    session: &mut Session,
    step: &StepId,
    iteration: u32,
    exchange_ref: Option<&str>,
    parsed: ParsedResponse,
    outcome: &mut ReboundOutcome,
) -> Result<Option<(NextAction, ResolvedScript)>> {
    if !parsed.thought_process.trim().is_empty() {
        session.recorder.transcript().prompt(&parsed.thought_process)?;
    }
    for (path, reason) in parsed.rejected() {
        warn!(path, reason = %reason, "unsafe artifact path dropped");
        session.recorder.log_event(
            LedgerEvent::new(Actor::Orchestrator, ActionKind::UnsafePath)
                .artifact(path)
                .exchange(exchange_ref)
                .step(step)
                .detail(reason.to_string()),
        )?;
        session
            .recorder
            .transcript()
            .error(&format!("Dropped artifact {path}: {reason}"))?;
    }

    let accepted: Vec<_> = parsed.accepted().cloned().collect();
    let staged = session
        .store
        .stage(step, iteration, exchange_ref, &accepted, &session.recorder)?;
    if !staged.is_empty() {
        session.recorder.transcript().wrapper(&format!(
            "Staged {} file(s): {}",
            staged.len(),
            staged
                .iter()
                .map(|artifact| artifact.staged_ref.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))?;
    }
    outcome.artifacts.extend(staged);
    outcome.thought_process = Some(parsed.thought_process);

    match parsed.next_action {
        NextActionDirective::Absent => Ok(None),
        NextActionDirective::Unrecognized {
            kind,
            target_script,
        } => {
            session.recorder.log_execution_blocked(
                Some(step),
                &target_script,
                &BlockReason::UnrecognizedActionKind(kind),
            )?;
            Ok(None)
        }
        NextActionDirective::Requested(action) => {
            match session
                .sandbox
                .authorize(&action.target_script, Some(step), &session.recorder)?
            {
                Ok(script) => Ok(Some((action, script))),
                Err(_) => Ok(None),
            }
        }
    }
}
