//! Shared helpers: glob patterns for filesystem rules and shell quoting for
//! sandbox wrappers.

pub mod glob;
pub mod shell;
