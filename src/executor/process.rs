//! Child process supervision: output budget, timeout and process-tree
//! termination.
//!
//! Every step runs in its own process group. Two reader tasks copy stdout
//! and stderr into shared buffers, admitting bytes against one
//! [`OutputBudget`]. The supervisor then waits for whichever comes first:
//!
//! - the process exits and both streams reach EOF
//! - the deadline passes
//! - the budget trips
//!
//! In the last two cases the whole group gets `SIGTERM`, then `SIGKILL`
//! after [`KILL_GRACE`].

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};

use crate::error::{ExecError, Result};

/// Time a process group gets to exit after `SIGTERM`.
pub const KILL_GRACE: Duration = Duration::from_millis(200);

/// How long to wait for readers once the group has been killed.
const DRAIN_AFTER_KILL: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 8 * 1024;

/// Combined byte allowance shared by every stream of one execution.
#[derive(Debug)]
pub struct OutputBudget {
    cap: u64,
    used: AtomicU64,
    tripped: AtomicBool,
    notify: Notify,
}

impl OutputBudget {
    pub fn new(cap: u64) -> Self {
        Self {
            cap,
            used: AtomicU64::new(0),
            tripped: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Claims up to `n` bytes and returns how many were granted. Granting
    /// fewer than `n` trips the budget.
    pub fn admit(&self, n: usize) -> usize {
        let mut granted = 0u64;
        // The closure always returns Some, so this cannot fail.
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                granted = self.cap.saturating_sub(used).min(n as u64);
                Some(used + granted)
            });

        if granted < n as u64 {
            self.trip();
        }
        granted as usize
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    fn trip(&self) {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }

    /// Resolves once the budget has tripped.
    async fn tripped(&self) {
        loop {
            if self.is_tripped() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

/// Collected output and terminal state of a run.
#[derive(Debug, Default)]
pub struct RawOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub timed_out: bool,
    pub capped: bool,
}

enum Verdict {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Capped,
}

type Sink = Arc<Mutex<Vec<u8>>>;

/// Runs `steps` in order under one deadline and one output budget. A step
/// exiting nonzero, a timeout or a tripped budget ends the run.
pub async fn run_steps(steps: Vec<Command>, limit: Duration, hard_cap: u64) -> Result<RawOutcome> {
    let deadline = Instant::now() + limit;
    let budget = Arc::new(OutputBudget::new(hard_cap));
    let stdout: Sink = Arc::default();
    let stderr: Sink = Arc::default();

    let mut outcome = RawOutcome::default();

    for command in steps {
        match run_step(command, deadline, &budget, &stdout, &stderr).await? {
            Verdict::Exited(status) => {
                let status = status.map_err(ExecError::Wait)?;
                outcome.exit_code = exit_code(status);
                if outcome.exit_code != 0 {
                    break;
                }
            }
            Verdict::TimedOut => {
                outcome.timed_out = true;
                outcome.exit_code = exit_code_after_kill();
                break;
            }
            Verdict::Capped => {
                outcome.capped = true;
                outcome.exit_code = exit_code_after_kill();
                break;
            }
        }
    }

    outcome.stdout = take(&stdout);
    outcome.stderr = take(&stderr);
    Ok(outcome)
}

async fn run_step(
    mut command: Command,
    deadline: Instant,
    budget: &Arc<OutputBudget>,
    stdout: &Sink,
    stderr: &Sink,
) -> Result<Verdict> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let program = command.as_std().get_program().to_string_lossy().into_owned();
    let mut child = command
        .spawn()
        .map_err(|source| ExecError::Spawn { program: program.clone(), source })?;
    let pid = child.id();
    tracing::debug!("Spawned {} (pid {:?})", program, pid);

    let mut readers = [
        spawn_reader(child.stdout.take(), stdout.clone(), budget.clone()),
        spawn_reader(child.stderr.take(), stderr.clone(), budget.clone()),
    ];

    let verdict = tokio::select! {
        biased;
        _ = budget.tripped() => Verdict::Capped,
        _ = sleep_until(deadline) => Verdict::TimedOut,
        status = wait_and_drain(&mut child, &mut readers) => Verdict::Exited(status),
    };

    match verdict {
        Verdict::Exited(_) => {}
        Verdict::TimedOut | Verdict::Capped => {
            tracing::debug!(
                "Terminating process group of {} ({})",
                program,
                if matches!(verdict, Verdict::Capped) { "output cap" } else { "timeout" }
            );
            kill_tree(&mut child, pid).await;
            for reader in &mut readers {
                if timeout(DRAIN_AFTER_KILL, &mut *reader).await.is_err() {
                    reader.abort();
                }
            }
        }
    }

    Ok(verdict)
}

async fn wait_and_drain(
    child: &mut Child,
    readers: &mut [JoinHandle<()>; 2],
) -> std::io::Result<ExitStatus> {
    let status = child.wait().await?;
    for reader in readers.iter_mut() {
        // Readers never panic; a join error only means cancellation.
        let _ = reader.await;
    }
    Ok(status)
}

fn spawn_reader<R>(source: Option<R>, sink: Sink, budget: Arc<OutputBudget>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut source) = source else {
            return;
        };
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match source.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let granted = budget.admit(n);
            if granted > 0 {
                lock(&sink).extend_from_slice(&buf[..granted]);
            }
            if granted < n {
                break;
            }
        }
    })
}

/// `SIGTERM` to the group, a grace window for the leader, then `SIGKILL`
/// to the group regardless, since descendants may outlive the leader.
#[cfg(unix)]
async fn kill_tree(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        let _ = child.start_kill();
        return;
    };
    let group = Pid::from_raw(pid as i32);

    if let Err(e) = killpg(group, Signal::SIGTERM) {
        tracing::debug!("SIGTERM to process group {} failed: {}", pid, e);
    }
    let _ = timeout(KILL_GRACE, child.wait()).await;

    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!("SIGKILL to process group {} failed: {}", pid, e),
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn kill_tree(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Exit code, or `128 + signal` for a signalled process.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Reported for runs we killed ourselves; the leader's real status is
/// not meaningful then.
fn exit_code_after_kill() -> i32 {
    #[cfg(unix)]
    {
        128 + nix::sys::signal::Signal::SIGKILL as i32
    }
    #[cfg(not(unix))]
    {
        -1
    }
}

fn lock(sink: &Sink) -> std::sync::MutexGuard<'_, Vec<u8>> {
    sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn take(sink: &Sink) -> Vec<u8> {
    std::mem::take(&mut *lock(sink))
}
