//! Stable exit codes for steward CLI commands.

/// Command succeeded; for `implement`, the step completed and was applied
/// (or had nothing to apply).
pub const OK: i32 = 0;
/// Invalid layout/config/arguments or any other error.
pub const INVALID: i32 = 1;
/// Empty instruction; nothing was sent to the model.
pub const CANCELLED: i32 = 2;
/// The Rebound loop hit `max_loops`.
pub const LOOP_LIMIT: i32 = 3;
/// Nothing was merged: malformed response, model failure, or the operator
/// rejected or aborted the review.
pub const NOT_APPLIED: i32 = 4;
/// `steward exec` refused the script.
pub const EXECUTION_BLOCKED: i32 = 5;
