//! I/O helpers for agent commands.

pub mod config;
pub mod init;
pub mod model;
pub mod process;
pub mod prompt;
pub mod session_store;
pub mod tools;
