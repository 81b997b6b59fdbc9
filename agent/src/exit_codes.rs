//! Stable exit codes for agent CLI commands.

/// Command succeeded or the request ended with a final answer.
pub const OK: i32 = 0;
/// Invalid usage, layout, config, or session id.
pub const INVALID: i32 = 1;
/// The step budget ran out before a final answer.
pub const BUDGET_EXHAUSTED: i32 = 2;
/// The model service or the session store failed.
pub const FATAL: i32 = 3;
/// The request was interrupted.
pub const CANCELLED: i32 = 4;
