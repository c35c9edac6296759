//! Execution sessions.
//!
//! An [`Executor`] owns the project root, a [`RuntimeMap`] snapshot and a
//! shared [`SandboxHandle`]. Each call to [`Executor::execute`] is an
//! independent session:
//!
//! 1. **Materializing**: the code is written to a scratch directory
//! 2. **Running**: the toolchain's argv is built, wrapped by the sandbox if
//!    one is active, and spawned in its own process group
//! 3. **Terminal**: completed, timed out or capped
//!
//! Setup problems (unknown toolchain, unreadable file, spawn failure) are
//! returned as [`ExecError`] before anything runs. Everything the program
//! itself does, including failing, is reported in [`ExecutionResult`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use polyrun::executor::Executor;
//! use polyrun::runtime::{detect_runtimes, Language};
//! use polyrun::sandbox::SandboxHandle;
//!
//! # async fn example() -> Result<(), polyrun::error::ExecError> {
//! let executor = Executor::new("/work/project", detect_runtimes(), Arc::new(SandboxHandle::passthrough()));
//! let result = executor.run(Language::Python, "print('ok')", None, None, None).await?;
//! assert_eq!(result.stdout, "ok\n");
//! # Ok(())
//! # }
//! ```

pub mod materialize;
pub mod process;
pub mod truncate;

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::error::Result;
use crate::runtime::{build_command, Language, RuntimeMap};
use crate::sandbox::SandboxHandle;
use crate::utils::shell;

use materialize::{check_readable, materialize, resolve_source_path};
use process::{run_steps, RawOutcome};
use truncate::smart_truncate;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HARD_CAP_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 100 * 1024;

/// Environment added to every child.
const CHILD_ENV: &[(&str, &str)] = &[
    ("NO_COLOR", "1"),
    ("PYTHONDONTWRITEBYTECODE", "1"),
    ("PYTHONUNBUFFERED", "1"),
];

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Code run as is.
    Inline(String),
    /// Code run with the contents of `path` bound to `FILE_CONTENT`.
    File { path: PathBuf, code: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub language: Language,
    pub source: Source,
    pub timeout: Duration,
    pub hard_cap_bytes: u64,
    pub max_output_bytes: usize,
}

impl ExecutionRequest {
    pub fn inline(language: Language, code: impl Into<String>) -> Self {
        Self::with_source(language, Source::Inline(code.into()))
    }

    pub fn file(language: Language, path: impl Into<PathBuf>, code: impl Into<String>) -> Self {
        Self::with_source(
            language,
            Source::File {
                path: path.into(),
                code: code.into(),
            },
        )
    }

    fn with_source(language: Language, source: Source) -> Self {
        Self {
            language,
            source,
            timeout: DEFAULT_TIMEOUT,
            hard_cap_bytes: DEFAULT_HARD_CAP_BYTES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn hard_cap_bytes(mut self, bytes: u64) -> Self {
        self.hard_cap_bytes = bytes;
        self
    }

    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Raw exit code; `128 + signal` when the process was signalled.
    pub exit_code: i32,
    pub timed_out: bool,
    /// The hard output cap was hit and the process tree killed.
    pub capped: bool,
}

impl ExecutionResult {
    /// Exit code zero and neither timed out nor capped.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.capped
    }
}

/// Runs code for one project. Cheap to share behind `Arc`.
#[derive(Debug)]
pub struct Executor {
    project_root: PathBuf,
    runtimes: RuntimeMap,
    sandbox: Arc<SandboxHandle>,
}

impl Executor {
    pub fn new(project_root: impl Into<PathBuf>, runtimes: RuntimeMap, sandbox: Arc<SandboxHandle>) -> Self {
        Self {
            project_root: project_root.into(),
            runtimes,
            sandbox,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn runtimes(&self) -> &RuntimeMap {
        &self.runtimes
    }

    pub fn sandbox(&self) -> &SandboxHandle {
        &self.sandbox
    }

    /// Runs inline `code`. `None` limits take the defaults.
    pub async fn run(
        &self,
        language: Language,
        code: &str,
        timeout: Option<Duration>,
        hard_cap_bytes: Option<u64>,
        max_output_bytes: Option<usize>,
    ) -> Result<ExecutionResult> {
        let request = ExecutionRequest::inline(language, code);
        self.execute(&with_limits(request, timeout, hard_cap_bytes, max_output_bytes))
            .await
    }

    /// Runs `code` with the contents of `path` bound to `FILE_CONTENT`.
    /// Relative paths resolve against the project root.
    pub async fn run_file(
        &self,
        language: Language,
        path: impl AsRef<Path>,
        code: &str,
        timeout: Option<Duration>,
        hard_cap_bytes: Option<u64>,
        max_output_bytes: Option<usize>,
    ) -> Result<ExecutionResult> {
        let request = ExecutionRequest::file(language, path.as_ref(), code);
        self.execute(&with_limits(request, timeout, hard_cap_bytes, max_output_bytes))
            .await
    }

    /// Runs one request to completion.
    ///
    /// # Errors
    ///
    /// Only setup failures, raised before the program starts, and failure
    /// to reap the child.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let language = request.language;

        let (code, target) = match &request.source {
            Source::Inline(code) => (code.as_str(), None),
            Source::File { path, code } => {
                let resolved = resolve_source_path(&self.project_root, path);
                check_readable(&resolved)?;
                (code.as_str(), Some(resolved))
            }
        };

        // Fail on a missing toolchain before touching the filesystem.
        self.runtimes.require(language)?;

        let script = materialize(language, code, target.as_deref())?;
        let invocation = build_command(&self.runtimes, language, script.path())?;

        let cwd = match language {
            Language::Shell => self.project_root.as_path(),
            _ => script.dir(),
        };

        let steps = invocation
            .steps()
            .into_iter()
            .map(|argv| self.command(argv, cwd, script.env()))
            .collect();

        tracing::info!(
            "Executing {} (timeout {:?}, sandbox {})",
            language,
            request.timeout,
            self.sandbox.mechanism()
        );

        let raw = run_steps(steps, request.timeout, request.hard_cap_bytes).await?;
        let result = finish(raw, request.hard_cap_bytes, request.max_output_bytes);

        tracing::debug!(
            "{} finished: exit {}, timed_out {}, capped {}",
            language,
            result.exit_code,
            result.timed_out,
            result.capped
        );

        // The scratch directory lives until the child is gone.
        drop(script);
        Ok(result)
    }

    fn command(&self, argv: &[String], cwd: &Path, env: &[(String, String)]) -> Command {
        let mut command = if self.sandbox.sandboxed() {
            let mut command = Command::new("/bin/sh");
            command
                .arg("-c")
                .arg(self.sandbox.wrap_command(&shell::join(argv)));
            command
        } else {
            let mut command = Command::new(&argv[0]);
            command.args(&argv[1..]);
            command
        };

        command.current_dir(cwd);
        command.envs(CHILD_ENV.iter().copied());
        command.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        command
    }
}

fn with_limits(
    mut request: ExecutionRequest,
    timeout: Option<Duration>,
    hard_cap_bytes: Option<u64>,
    max_output_bytes: Option<usize>,
) -> ExecutionRequest {
    if let Some(timeout) = timeout {
        request.timeout = timeout;
    }
    if let Some(bytes) = hard_cap_bytes {
        request.hard_cap_bytes = bytes;
    }
    if let Some(bytes) = max_output_bytes {
        request.max_output_bytes = bytes;
    }
    request
}

/// Turns raw output into the final result: cap diagnostic or smart
/// truncation, never both.
fn finish(raw: RawOutcome, hard_cap_bytes: u64, max_output_bytes: usize) -> ExecutionResult {
    let RawOutcome {
        mut stdout,
        mut stderr,
        exit_code,
        timed_out,
        capped,
    } = raw;

    if capped {
        trim_partial_utf8(&mut stdout);
        trim_partial_utf8(&mut stderr);
    }

    let mut stdout = String::from_utf8_lossy(&stdout).into_owned();
    let mut stderr = String::from_utf8_lossy(&stderr).into_owned();

    if capped {
        append_cap_diagnostic(&mut stderr, hard_cap_bytes);
    } else if !timed_out {
        stdout = smart_truncate(&stdout, max_output_bytes);
        stderr = smart_truncate(&stderr, max_output_bytes);
    }

    ExecutionResult {
        stdout,
        stderr,
        exit_code,
        timed_out,
        capped,
    }
}

/// Appends the cap diagnostic to `stderr`, starting it on a line of its
/// own. The separating newline, when one is needed, belongs to the
/// diagnostic: everything before it is program output, at most
/// `hard_cap_bytes` together with stdout.
fn append_cap_diagnostic(stderr: &mut String, hard_cap_bytes: u64) {
    if !stderr.is_empty() && !stderr.ends_with('\n') {
        stderr.push('\n');
    }
    stderr.push_str(&cap_diagnostic(hard_cap_bytes));
}

/// The stderr line appended when the cap kills a run.
pub fn cap_diagnostic(hard_cap_bytes: u64) -> String {
    format!(
        "[output capped: exceeded hard limit of {} bytes ({}); process tree killed]\n",
        hard_cap_bytes,
        human_bytes(hard_cap_bytes)
    )
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Drops an incomplete UTF-8 sequence cut off by the cap.
fn trim_partial_utf8(bytes: &mut Vec<u8>) {
    if let Err(e) = std::str::from_utf8(bytes) {
        if e.error_len().is_none() {
            bytes.truncate(e.valid_up_to());
        }
    }
}
