//! Append-only audit trail: event stream, transaction stream and raw
//! model exchanges.
//!
//! The recorder is constructed once per session and passed by reference to
//! every component that needs to log. Each record is serialized to one line
//! and written with a single `write_all` on a file opened in append mode, so
//! concurrent appenders cannot interleave partial lines.
//!
//! Failure policy: an event or transaction that cannot be written is a hard
//! error (the audit trail is the product). A raw exchange that cannot be
//! stored is recorded as a `storage_failure` event and the caller continues
//! with a null `exchange_ref`.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::init::StewardPaths;
use super::transcript::Transcript;
use crate::core::execution::BlockReason;
use crate::core::ids::{SessionId, StepId, new_record_id};
use crate::core::types::{ActionKind, Actor, TokenUsage, TransactionStatus};

/// RFC 3339 UTC timestamp with millisecond precision.
pub fn timestamp_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// One line of `ledger/events.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub event_id: String,
    pub timestamp_utc: String,
    pub actor: Actor,
    pub action_type: ActionKind,
    pub artifact_refs: Vec<String>,
    /// Id of the raw exchange this event concerns; never a path.
    pub exchange_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LedgerEvent {
    pub fn new(actor: Actor, action_type: ActionKind) -> Self {
        Self {
            event_id: new_record_id(),
            timestamp_utc: timestamp_utc(),
            actor,
            action_type,
            artifact_refs: Vec::new(),
            exchange_ref: None,
            step_id: None,
            sha256: None,
            detail: None,
        }
    }

    pub fn artifact(mut self, path: impl Into<String>) -> Self {
        self.artifact_refs.push(path.into());
        self
    }

    pub fn artifacts<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.artifact_refs.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn exchange(mut self, exchange_ref: Option<&str>) -> Self {
        self.exchange_ref = exchange_ref.map(str::to_string);
        self
    }

    pub fn step(mut self, step: &StepId) -> Self {
        self.step_id = Some(step.to_string());
        self
    }

    pub fn sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One line of `ledger/audit_log.jsonl`: the coarse record of a finished step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub timestamp_utc: String,
    pub session_id: String,
    pub step_id: String,
    pub instruction: String,
    pub usage: TokenUsage,
    pub status: TransactionStatus,
}

impl Transaction {
    pub fn new(
        session: &SessionId,
        step: &StepId,
        instruction: &str,
        usage: TokenUsage,
        status: TransactionStatus,
    ) -> Self {
        Self {
            transaction_id: new_record_id(),
            timestamp_utc: timestamp_utc(),
            session_id: session.to_string(),
            step_id: step.to_string(),
            instruction: instruction.to_string(),
            usage,
            status,
        }
    }
}

/// Full request/response pair with the model, stored once by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub exchange_id: String,
    pub timestamp_utc: String,
    pub session_id: String,
    pub step_id: String,
    pub iteration: u32,
    pub request: Value,
    pub response: String,
    pub usage: TokenUsage,
}

pub struct AuditRecorder {
    session_id: SessionId,
    events_path: PathBuf,
    audit_log_path: PathBuf,
    raw_exchanges_dir: PathBuf,
    transcript: Transcript,
}

impl AuditRecorder {
    pub fn open(paths: &StewardPaths, session_id: &SessionId, echo: bool) -> Result<Self> {
        fs::create_dir_all(&paths.ledger_dir)
            .with_context(|| format!("create ledger dir {}", paths.ledger_dir.display()))?;
        let transcript =
            Transcript::open(paths.transcript_path(session_id), session_id.as_str(), echo)?;
        Ok(Self {
            session_id: session_id.clone(),
            events_path: paths.events_path.clone(),
            audit_log_path: paths.audit_log_path.clone(),
            raw_exchanges_dir: paths.raw_exchanges_dir(session_id),
            transcript,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn log_event(&self, event: LedgerEvent) -> Result<()> {
        debug!(action = ?event.action_type, refs = event.artifact_refs.len(), "ledger event");
        append_jsonl(&self.events_path, &event)
            .with_context(|| format!("write event log {}", self.events_path.display()))
    }

    pub fn log_transaction(&self, transaction: &Transaction) -> Result<()> {
        debug!(step = %transaction.step_id, status = ?transaction.status, "transaction");
        append_jsonl(&self.audit_log_path, transaction)
            .with_context(|| format!("write audit log {}", self.audit_log_path.display()))
    }

    /// Persist a raw exchange and return its id, or `None` if it could not
    /// be stored.
    pub fn record_exchange(&self, exchange: &Exchange) -> Result<Option<String>> {
        let path = self
            .raw_exchanges_dir
            .join(format!("{}.json", exchange.exchange_id));
        match write_exchange(&path, exchange) {
            Ok(()) => Ok(Some(exchange.exchange_id.clone())),
            Err(err) => {
                warn!(err = %err, "failed to store raw exchange");
                self.log_storage_failure(
                    &format!("raw_exchanges/{}.json", exchange.exchange_id),
                    None,
                    &err,
                )?;
                Ok(None)
            }
        }
    }

    /// Record a skipped write. Never carries an exchange reference.
    pub fn log_storage_failure(
        &self,
        target: &str,
        step: Option<&StepId>,
        err: &anyhow::Error,
    ) -> Result<()> {
        let mut event = LedgerEvent::new(Actor::Orchestrator, ActionKind::StorageFailure)
            .artifact(target)
            .detail(format!("{err:#}"));
        if let Some(step) = step {
            event = event.step(step);
        }
        self.log_event(event)?;
        self.transcript
            .error(&format!("storage failure for {target}: {err:#}"))
    }

    pub fn log_execution_blocked(
        &self,
        step: Option<&StepId>,
        script: &str,
        reason: &BlockReason,
    ) -> Result<()> {
        warn!(script, reason = reason.code(), "execution blocked");
        let mut event = LedgerEvent::new(Actor::Orchestrator, ActionKind::ExecutionBlocked)
            .artifact(script)
            .detail(format!("{}: {reason}", reason.code()));
        if let Some(step) = step {
            event = event.step(step);
        }
        self.log_event(event)?;
        self.transcript
            .error(&format!("execution blocked: {reason}"))
    }
}

fn write_exchange(path: &Path, exchange: &Exchange) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create exchange dir {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(exchange).context("serialize exchange")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write exchange {}", path.display()))
}

fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut line = serde_json::to_string(record).context("serialize record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

/// Read a JSONL stream, skipping lines that do not decode.
///
/// Returns the decoded records and the number of skipped lines. A missing
/// file reads as empty.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, usize)> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let mut records = Vec::new();
    let mut skipped = 0;
    for line in contents.lines().filter(|line| !line.trim().is_empty()) {
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(_) => skipped += 1,
        }
    }
    Ok((records, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::init::init_project;

    fn recorder(root: &Path) -> (StewardPaths, AuditRecorder) {
        let paths = init_project(root, false).expect("init");
        let session = SessionId::generate();
        let recorder = AuditRecorder::open(&paths, &session, false).expect("open recorder");
        (paths, recorder)
    }

    fn exchange(session: &SessionId) -> Exchange {
        Exchange {
            exchange_id: new_record_id(),
            timestamp_utc: timestamp_utc(),
            session_id: session.to_string(),
            step_id: "step_x".to_string(),
            iteration: 1,
            request: serde_json::json!({"user": "hi"}),
            response: "{}".to_string(),
            usage: TokenUsage::new(3, 4),
        }
    }

    #[test]
    fn streams_are_separate_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (paths, recorder) = recorder(temp.path());
        let step = StepId::generate();

        recorder
            .log_event(LedgerEvent::new(Actor::Operator, ActionKind::InstructionReceived).step(&step))
            .expect("event");
        recorder
            .log_transaction(&Transaction::new(
                recorder.session_id(),
                &step,
                "do it",
                TokenUsage::new(1, 2),
                TransactionStatus::Success,
            ))
            .expect("transaction");

        let (events, _) = read_jsonl::<LedgerEvent>(&paths.events_path).expect("events");
        let (txs, _) = read_jsonl::<Transaction>(&paths.audit_log_path).expect("txs");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action_type, ActionKind::InstructionReceived);
        assert_eq!(events[0].exchange_ref, None);
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].usage.total_tokens, 3);
    }

    #[test]
    fn event_line_has_required_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (paths, recorder) = recorder(temp.path());
        recorder
            .log_event(LedgerEvent::new(Actor::Orchestrator, ActionKind::Cancellation))
            .expect("event");

        let line = fs::read_to_string(&paths.events_path).expect("read");
        let value: Value = serde_json::from_str(line.trim()).expect("json");
        for key in [
            "event_id",
            "timestamp_utc",
            "actor",
            "action_type",
            "artifact_refs",
            "exchange_ref",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert!(value["exchange_ref"].is_null());
    }

    #[test]
    fn stored_exchange_is_referenced_by_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (paths, recorder) = recorder(temp.path());
        let exchange = exchange(recorder.session_id());

        let id = recorder.record_exchange(&exchange).expect("record");

        assert_eq!(id.as_deref(), Some(exchange.exchange_id.as_str()));
        let stored = paths
            .raw_exchanges_dir(recorder.session_id())
            .join(format!("{}.json", exchange.exchange_id));
        assert!(stored.is_file());
    }

    #[test]
    fn exchange_storage_failure_is_logged_not_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (paths, recorder) = recorder(temp.path());
        let raw_dir = paths.raw_exchanges_dir(recorder.session_id());
        fs::create_dir_all(raw_dir.parent().expect("parent")).expect("session dir");
        fs::write(&raw_dir, "not a directory").expect("block dir");

        let id = recorder
            .record_exchange(&exchange(recorder.session_id()))
            .expect("record");

        assert_eq!(id, None);
        let (events, _) = read_jsonl::<LedgerEvent>(&paths.events_path).expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action_type, ActionKind::StorageFailure);
        assert_eq!(events[0].exchange_ref, None);
    }

    #[test]
    fn event_write_failure_is_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (paths, recorder) = recorder(temp.path());
        fs::remove_file(&paths.events_path).expect("remove");
        fs::create_dir(&paths.events_path).expect("replace with dir");

        let err = recorder
            .log_event(LedgerEvent::new(Actor::Operator, ActionKind::Cancellation))
            .unwrap_err();
        assert!(format!("{err:#}").contains("write event log"));
    }

    #[test]
    fn read_jsonl_skips_malformed_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("x.jsonl");
        fs::write(&path, "{\"a\":1}\nnope\n\n{\"a\":2}\n").expect("write");

        let (rows, skipped) = read_jsonl::<Value>(&path).expect("read");
        assert_eq!(rows.len(), 2);
        assert_eq!(skipped, 1);

        let (rows, skipped) =
            read_jsonl::<Value>(&temp.path().join("missing.jsonl")).expect("missing");
        assert!(rows.is_empty());
        assert_eq!(skipped, 0);
    }
}
