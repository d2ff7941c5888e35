//! Rebound state machine.
//!
//! The loop bound is carried in the state itself (`iteration`), so the
//! orchestrator can be a plain `loop` over [`transition`] rather than
//! recursion.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// Final reply received without a runnable next action.
    Completed,
    LoopLimitExceeded,
    MalformedResponse,
    ModelFailure,
    /// Zero-Waste guard rejected an empty instruction.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReboundState {
    AwaitingInstruction,
    CallingModel { iteration: u32 },
    ApplyingArtifacts { iteration: u32 },
    ExecutingAction { iteration: u32 },
    Terminal(TerminalStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReboundEvent {
    Instruction { empty: bool },
    ModelReplied,
    ModelFailed,
    /// `action_ready` is true only when the reply names a next action whose
    /// script passed every sandbox precondition.
    Parsed { action_ready: bool },
    Malformed,
    ActionExecuted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid rebound transition: {event:?} in {state:?}")]
pub struct InvalidTransition {
    pub state: ReboundState,
    pub event: ReboundEvent,
}

/// Advance the machine by one event.
///
/// Iterations are numbered from 1. `max_loops` bounds the number of model
/// calls and of executions: an execution finishing iteration `max_loops`
/// ends the loop with [`TerminalStatus::LoopLimitExceeded`].
pub fn transition(
    state: ReboundState,
    event: ReboundEvent,
    max_loops: u32,
) -> Result<ReboundState, InvalidTransition> {
    use ReboundEvent as E;
    use ReboundState as S;

    let next = match (state, event) {
        (S::AwaitingInstruction, E::Instruction { empty: true }) => S::AwaitingInstruction,
        (S::AwaitingInstruction, E::Instruction { empty: false }) => {
            S::CallingModel { iteration: 1 }
        }
        (S::CallingModel { iteration }, E::ModelReplied) => S::ApplyingArtifacts { iteration },
        (S::CallingModel { .. }, E::ModelFailed) => S::Terminal(TerminalStatus::ModelFailure),
        (S::ApplyingArtifacts { .. }, E::Malformed) => {
            S::Terminal(TerminalStatus::MalformedResponse)
        }
        (S::ApplyingArtifacts { iteration }, E::Parsed { action_ready: true }) => {
            S::ExecutingAction { iteration }
        }
        (S::ApplyingArtifacts { .. }, E::Parsed { action_ready: false }) => {
            S::Terminal(TerminalStatus::Completed)
        }
        (S::ExecutingAction { iteration }, E::ActionExecuted) => {
            if iteration >= max_loops {
                S::Terminal(TerminalStatus::LoopLimitExceeded)
            } else {
                S::CallingModel {
                    iteration: iteration + 1,
                }
            }
        }
        (state, event) => return Err(InvalidTransition { state, event }),
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(events: &[ReboundEvent], max_loops: u32) -> ReboundState {
        events
            .iter()
            .try_fold(ReboundState::AwaitingInstruction, |state, event| {
                transition(state, *event, max_loops)
            })
            .expect("valid transitions")
    }

    #[test]
    fn empty_instruction_stays_awaiting() {
        assert_eq!(
            run(&[ReboundEvent::Instruction { empty: true }], 5),
            ReboundState::AwaitingInstruction
        );
    }

    #[test]
    fn single_reply_without_action_completes() {
        let state = run(
            &[
                ReboundEvent::Instruction { empty: false },
                ReboundEvent::ModelReplied,
                ReboundEvent::Parsed {
                    action_ready: false,
                },
            ],
            5,
        );
        assert_eq!(state, ReboundState::Terminal(TerminalStatus::Completed));
    }

    #[test]
    fn zero_artifacts_with_action_still_executes() {
        let state = run(
            &[
                ReboundEvent::Instruction { empty: false },
                ReboundEvent::ModelReplied,
                ReboundEvent::Parsed { action_ready: true },
                ReboundEvent::ActionExecuted,
            ],
            5,
        );
        assert_eq!(state, ReboundState::CallingModel { iteration: 2 });
    }

    #[test]
    fn loop_bound_is_enforced() {
        let max = 3;
        let mut state = transition(
            ReboundState::AwaitingInstruction,
            ReboundEvent::Instruction { empty: false },
            max,
        )
        .expect("start");
        let mut executions = 0;
        while let ReboundState::CallingModel { .. } = state {
            state = transition(state, ReboundEvent::ModelReplied, max).expect("reply");
            state = transition(state, ReboundEvent::Parsed { action_ready: true }, max)
                .expect("parsed");
            state = transition(state, ReboundEvent::ActionExecuted, max).expect("executed");
            executions += 1;
        }
        assert_eq!(executions, max);
        assert_eq!(
            state,
            ReboundState::Terminal(TerminalStatus::LoopLimitExceeded)
        );
    }

    #[test]
    fn failures_are_terminal_and_terminal_is_final() {
        let failed = run(
            &[
                ReboundEvent::Instruction { empty: false },
                ReboundEvent::ModelFailed,
            ],
            5,
        );
        assert_eq!(failed, ReboundState::Terminal(TerminalStatus::ModelFailure));
        assert!(transition(failed, ReboundEvent::ModelReplied, 5).is_err());
    }
}
