//! Local coding agent with verified edits.
//!
//! The agent answers a user request by looping over model decisions: each
//! step either answers the user or calls one tool. Successful edits are
//! verified by a static check, a regression test and a second reviewer model.
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (budget, decision parsing, safety
//!   filter, compaction, verdict extraction). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, processes, session logs,
//!   model client, prompts, tools). Isolated behind traits to enable scripted tests.
//!
//! Orchestration modules ([`orchestrator`], [`verify`], [`review`]) coordinate
//! core logic with I/O to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod review;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
