//! Local governance layer around a chat model.
//!
//! An operator instruction goes through one bounded **Rebound** step: the
//! model answers with structured JSON, proposed files are staged (never
//! written in place), and a requested script runs inside a sandbox with its
//! output fed back to the model. Every turn lands in two ledgers: a
//! fine-grained event log and a coarse transaction log.
//!
//! - **[`core`]**: Pure, deterministic logic (response parsing, path rules,
//!   the Rebound state machine, ids and records). No I/O.
//! - **[`io`]**: Side effects (ledgers, content store, sandbox, model bridge,
//!   git, prompts). Isolated behind small seams so tests can swap them.
//!
//! Orchestration modules ([`rebound`], [`implement`], [`report`]) coordinate
//! the two to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod implement;
pub mod io;
pub mod logging;
pub mod rebound;
pub mod report;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
