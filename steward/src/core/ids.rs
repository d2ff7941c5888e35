//! Session, step and record identifiers.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;

const SUFFIX_LEN: usize = 6;

/// Identifier of one process invocation: `YYYYMMDD_HHMMSS_<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    value: String,
    date: String,
}

impl SessionId {
    pub fn from_parts(at: DateTime<Utc>, suffix: &str) -> Self {
        Self {
            value: format!("{}_{}", at.format("%Y%m%d_%H%M%S"), suffix),
            date: at.format("%Y-%m-%d").to_string(),
        }
    }

    pub fn generate() -> Self {
        Self::from_parts(Utc::now(), &short_suffix())
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Calendar date (`YYYY-MM-DD`) naming the session directory.
    pub fn date(&self) -> &str {
        &self.date
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Identifier of one Rebound run; doubles as its staging directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepId(String);

impl StepId {
    pub fn from_parts(at: DateTime<Utc>, suffix: &str) -> Self {
        Self(format!("step_{}_{}", at.format("%Y%m%d_%H%M%S"), suffix))
    }

    pub fn generate() -> Self {
        Self::from_parts(Utc::now(), &short_suffix())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fresh UUID v4 for events, transactions and exchanges.
pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn short_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}
