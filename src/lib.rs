//! polyrun - sandboxed polyglot code execution
//!
//! Runs caller-supplied source code in one of several languages under a
//! timeout, a hard output cap and OS-level confinement (Seatbelt on macOS,
//! Bubblewrap on Linux), and returns a bounded result.

pub mod config;
pub mod error;
pub mod executor;
pub mod network;
pub mod runtime;
pub mod sandbox;
pub mod utils;

pub use config::{build_sandbox_config, SandboxConfig};
pub use error::ExecError;
pub use executor::truncate::smart_truncate;
pub use executor::{ExecutionRequest, ExecutionResult, Executor, Source};
pub use runtime::{build_command, detect_runtimes, Language, RuntimeMap};
pub use sandbox::{init_sandbox, SandboxHandle};
