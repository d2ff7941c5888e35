//! Sandboxed execution results.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exit code reported for a script killed by the wall-clock timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Timeout,
}

/// Captured result of one script run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Script path relative to the project root, `/`-separated.
    pub script: String,
    pub args: Vec<String>,
    pub status: ExecutionStatus,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Set when either stream exceeded the output limit.
    pub truncated: bool,
}

impl ExecutionRecord {
    /// Exit code as shown to the model; timeouts report [`TIMEOUT_EXIT_CODE`].
    pub fn reported_exit_code(&self) -> i32 {
        match (self.status, self.exit_code) {
            (ExecutionStatus::Timeout, _) => TIMEOUT_EXIT_CODE,
            (_, Some(code)) => code,
            (_, None) => -1,
        }
    }
}

/// Sandbox precondition violations, listed in enforcement order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockReason {
    #[error("script path is empty")]
    EmptyPath,
    #[error("script path is absolute: {0}")]
    AbsolutePath(String),
    #[error("script resolves outside the sandbox root: {0}")]
    OutsideSandbox(String),
    #[error("script not found: {0}")]
    NotFound(String),
    #[error("script is not a regular file: {0}")]
    NotAFile(String),
    #[error("no interpreter configured for script: {0}")]
    UnsupportedScriptType(String),
    #[error("unrecognized next_action type: {0}")]
    UnrecognizedActionKind(String),
}

impl BlockReason {
    /// Stable snake_case code written to the event stream.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyPath => "empty_path",
            Self::AbsolutePath(_) => "absolute_path",
            Self::OutsideSandbox(_) => "outside_sandbox",
            Self::NotFound(_) => "not_found",
            Self::NotAFile(_) => "not_a_file",
            Self::UnsupportedScriptType(_) => "unsupported_script_type",
            Self::UnrecognizedActionKind(_) => "unrecognized_action_kind",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed(ExecutionRecord),
    Failed(ExecutionRecord),
    TimedOut(ExecutionRecord),
    Blocked(BlockReason),
}

impl ExecutionOutcome {
    /// Classify a finished run by its record status.
    pub fn from_record(record: ExecutionRecord) -> Self {
        match record.status {
            ExecutionStatus::Success => Self::Completed(record),
            ExecutionStatus::Failure => Self::Failed(record),
            ExecutionStatus::Timeout => Self::TimedOut(record),
        }
    }

    pub fn record(&self) -> Option<&ExecutionRecord> {
        match self {
            Self::Completed(record) | Self::Failed(record) | Self::TimedOut(record) => {
                Some(record)
            }
            Self::Blocked(_) => None,
        }
    }

    pub fn into_record(self) -> Result<ExecutionRecord, BlockReason> {
        match self {
            Self::Completed(record) | Self::Failed(record) | Self::TimedOut(record) => Ok(record),
            Self::Blocked(reason) => Err(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: ExecutionStatus, exit_code: Option<i32>) -> ExecutionRecord {
        ExecutionRecord {
            script: "workbench/scripts/t.sh".to_string(),
            args: Vec::new(),
            status,
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
            truncated: false,
        }
    }

    #[test]
    fn outcome_follows_record_status() {
        assert!(matches!(
            ExecutionOutcome::from_record(record(ExecutionStatus::Success, Some(0))),
            ExecutionOutcome::Completed(_)
        ));
        assert!(matches!(
            ExecutionOutcome::from_record(record(ExecutionStatus::Failure, Some(2))),
            ExecutionOutcome::Failed(_)
        ));
        let timed_out = ExecutionOutcome::from_record(record(ExecutionStatus::Timeout, None));
        assert_eq!(
            timed_out.record().map(ExecutionRecord::reported_exit_code),
            Some(TIMEOUT_EXIT_CODE)
        );
    }

    #[test]
    fn blocked_has_no_record() {
        let outcome = ExecutionOutcome::Blocked(BlockReason::EmptyPath);
        assert!(outcome.record().is_none());
        assert_eq!(outcome.into_record(), Err(BlockReason::EmptyPath));
    }
}
