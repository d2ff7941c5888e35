//! Decoding of the model's structured reply.
//!
//! Raw text goes through three gates: optional markdown fence stripping,
//! JSON Schema validation, then a typed decode. The result is a closed
//! [`ParseOutcome`] so callers never see an untyped error for bad model
//! output. Artifact paths are checked individually; a bad path drops that
//! artifact only.

use std::path::PathBuf;
use std::sync::LazyLock;

use jsonschema::Validator;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::path::{UnsafePathReason, normalize_relative};

const RESPONSE_SCHEMA: &str = include_str!("../../schemas/response.schema.json");

static RESPONSE_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(RESPONSE_SCHEMA).expect("response schema should be valid json");
    jsonschema::validator_for(&schema).expect("response schema should compile")
});

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^```[A-Za-z]*\s*(.*?)\s*```$").unwrap());

/// Why a reply could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedResponse {
    #[error("response is not valid JSON: {0}")]
    NotJson(String),
    #[error("response violates schema: {}", .0.join("; "))]
    Schema(Vec<String>),
    #[error("response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOperation {
    Create,
    #[serde(alias = "edit")]
    Update,
}

/// An artifact whose path passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedArtifact {
    /// Normalized relative destination.
    pub path: PathBuf,
    pub operation: ArtifactOperation,
    pub content: String,
}

/// Per-artifact verdict, in reply order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactDecision {
    Accepted(ProposedArtifact),
    UnsafePath {
        path: String,
        reason: UnsafePathReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextActionKind {
    ExecAndChain,
}

impl NextActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExecAndChain => "exec_and_chain",
        }
    }
}

/// A request to run a sandboxed script and feed its result back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NextAction {
    pub kind: NextActionKind,
    /// Raw script path as the model wrote it; resolved by the sandbox.
    pub target_script: String,
    pub continuation: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextActionDirective {
    Absent,
    Requested(NextAction),
    /// Present but of a kind this build does not know; treated as absent.
    Unrecognized {
        kind: String,
        target_script: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub thought_process: String,
    pub artifacts: Vec<ArtifactDecision>,
    pub next_action: NextActionDirective,
}

impl ParsedResponse {
    pub fn accepted(&self) -> impl Iterator<Item = &ProposedArtifact> {
        self.artifacts.iter().filter_map(|decision| match decision {
            ArtifactDecision::Accepted(artifact) => Some(artifact),
            ArtifactDecision::UnsafePath { .. } => None,
        })
    }

    pub fn rejected(&self) -> impl Iterator<Item = (&str, &UnsafePathReason)> {
        self.artifacts.iter().filter_map(|decision| match decision {
            ArtifactDecision::UnsafePath { path, reason } => Some((path.as_str(), reason)),
            ArtifactDecision::Accepted(_) => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Parsed(ParsedResponse),
    Malformed(MalformedResponse),
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    thought_process: String,
    artifacts: Vec<WireArtifact>,
    #[serde(default)]
    next_action: Option<WireNextAction>,
}

#[derive(Debug, Deserialize)]
struct WireArtifact {
    path: String,
    #[serde(default)]
    operation: Option<ArtifactOperation>,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireNextAction {
    #[serde(rename = "type")]
    kind: String,
    target_script: String,
    continuation_prompt: String,
}

/// Parse one raw model reply.
pub fn parse_response(raw: &str) -> ParseOutcome {
    let body = strip_fence(raw);
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(err) => return ParseOutcome::Malformed(MalformedResponse::NotJson(err.to_string())),
    };

    if !RESPONSE_VALIDATOR.is_valid(&value) {
        let messages = RESPONSE_VALIDATOR
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return ParseOutcome::Malformed(MalformedResponse::Schema(messages));
    }

    let wire: WireResponse = match serde_json::from_value(value) {
        Ok(wire) => wire,
        Err(err) => return ParseOutcome::Malformed(MalformedResponse::Decode(err.to_string())),
    };

    let artifacts = wire.artifacts.into_iter().map(decide_artifact).collect();
    let next_action = match wire.next_action {
        None => NextActionDirective::Absent,
        Some(action) if action.kind == NextActionKind::ExecAndChain.as_str() => {
            NextActionDirective::Requested(NextAction {
                kind: NextActionKind::ExecAndChain,
                target_script: action.target_script,
                continuation: action.continuation_prompt,
            })
        }
        Some(action) => NextActionDirective::Unrecognized {
            kind: action.kind,
            target_script: action.target_script,
        },
    };

    ParseOutcome::Parsed(ParsedResponse {
        thought_process: wire.thought_process,
        artifacts,
        next_action,
    })
}

fn decide_artifact(wire: WireArtifact) -> ArtifactDecision {
    match normalize_relative(&wire.path) {
        Ok(path) => ArtifactDecision::Accepted(ProposedArtifact {
            path,
            operation: wire.operation.unwrap_or(ArtifactOperation::Create),
            content: wire.content,
        }),
        Err(reason) => ArtifactDecision::UnsafePath {
            path: wire.path,
            reason,
        },
    }
}

/// Remove a single surrounding markdown code fence, if any.
fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    match FENCE_RE.captures(trimmed).and_then(|caps| caps.get(1)) {
        Some(inner) => inner.as_str(),
        None => trimmed,
    }
}
