//! Deterministic, pure logic shared by the steward core.
//!
//! Core modules must be free of filesystem and process side effects. They
//! decode model output, validate paths and drive the Rebound state machine
//! over in-memory values, which keeps them testable in isolation.

pub mod execution;
pub mod ids;
pub mod path;
pub mod response;
pub mod state;
pub mod types;
