//! Error types for the execution boundary.
//!
//! Everything in [`ExecError`] except [`ExecError::Wait`] is a setup error:
//! it is raised before any process exists and is never retried. Failures of
//! the executed program itself (nonzero exit, uncaught exception), timeouts
//! and output-cap overflows are not errors; they are encoded in
//! [`ExecutionResult`](crate::executor::ExecutionResult).

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::runtime::Language;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("{language} is not available: `{toolchain}` was not found on PATH. {hint}")]
    RuntimeUnavailable {
        language: Language,
        toolchain: &'static str,
        hint: &'static str,
    },

    #[error("cannot read {}: {source}", path.display())]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to materialize script: {0}")]
    Materialize(#[source] io::Error),

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for child process: {0}")]
    Wait(#[source] io::Error),
}

impl ExecError {
    /// True when the error was raised before any process was started.
    pub fn is_setup_error(&self) -> bool {
        !matches!(self, ExecError::Wait(_))
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
