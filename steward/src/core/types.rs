//! Shared record types for the audit trail.
//!
//! These enums are serialized into the event and transaction streams, so
//! their snake_case spellings are part of the on-disk format.

use serde::{Deserialize, Serialize};

/// Who caused a ledger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Operator,
    Orchestrator,
    Model,
}

/// Kind of a fine-grained ledger event (`action_type` on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Empty instruction rejected by the Zero-Waste guard.
    Cancellation,
    InstructionReceived,
    ApiRequest,
    ApiResponse,
    ApiFailure,
    MalformedResponse,
    FileWrite,
    /// Artifact dropped because its path escapes the staging root.
    UnsafePath,
    StorageFailure,
    ScriptExecuted,
    /// Sandbox precondition violated; security-relevant, never an operational error.
    ExecutionBlocked,
    LoopLimitExceeded,
    ManifestWritten,
    ArtifactsApplied,
    ArtifactsDiscarded,
}

/// Token counts reported by the model service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    pub fn accumulate(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Terminal status of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Success,
    Failure,
}
