//! Linux Bubblewrap confinement.
//!
//! Every command runs inside `bwrap` with fresh PID and network namespaces
//! and a read-only view of the root filesystem:
//!
//! - `allowWrite` roots are bound read-write on top of it
//! - existing `denyWrite` files below those roots are re-bound read-only,
//!   missing ones are masked with `/dev/null` so they cannot be created
//! - `denyRead` directories are hidden under an empty tmpfs, files are
//!   masked with `/dev/null`
//!
//! An unshared network namespace has only a loopback interface. When
//! `socat` is installed, the filtering proxy is exposed through a Unix
//! socket and a `socat` bridge inside the namespace forwards
//! `127.0.0.1:3128` to it, so HTTP clients honouring `HTTP_PROXY` can reach
//! allow-listed hosts. Without `socat` the child has no network at all.

use std::path::{Path, PathBuf};

use crate::config::SandboxConfig;
use crate::network::proxy::proxy_env;
use crate::sandbox::Confinement;
use crate::utils::glob::is_glob;
use crate::utils::shell::{join, quote};

/// Port the in-namespace bridge listens on.
pub const BRIDGE_PORT: u16 = 3128;

/// Commands run under `bwrap`.
#[derive(Debug, Clone)]
pub struct Bubblewrap {
    program: PathBuf,
    args: Vec<String>,
    bridge_socket: Option<PathBuf>,
    /// Mount points `bwrap` creates on the host for masked files.
    placeholders: Vec<PathBuf>,
}

impl Bubblewrap {
    /// `bridge_socket` is the proxy's Unix socket; `None` means no network.
    pub fn new(program: PathBuf, config: &SandboxConfig, bridge_socket: Option<PathBuf>) -> Self {
        let (args, placeholders) = build_args(config);
        Self {
            program,
            args,
            bridge_socket,
            placeholders,
        }
    }

    pub fn placeholders(&self) -> &[PathBuf] {
        &self.placeholders
    }
}

impl Confinement for Bubblewrap {
    fn mechanism(&self) -> &'static str {
        "bubblewrap"
    }

    fn release(&self) {
        remove_placeholders(&self.placeholders);
    }

    fn wrap_command(&self, command: &str) -> String {
        let inner = match &self.bridge_socket {
            Some(socket) => {
                let url = format!("http://127.0.0.1:{}", BRIDGE_PORT);
                // Wait until the bridge accepts connections, for at most a second.
                format!(
                    "socat TCP-LISTEN:{port},bind=127.0.0.1,fork,reuseaddr UNIX-CONNECT:{} >/dev/null 2>&1 & \
                     _pr_i=0; until socat -u /dev/null TCP:127.0.0.1:{port} 2>/dev/null || [ $_pr_i -ge 50 ]; \
                     do sleep 0.02; _pr_i=$((_pr_i + 1)); done; unset _pr_i; export {}; {}",
                    quote(&socket.to_string_lossy()),
                    join(&proxy_env(&url)),
                    command,
                    port = BRIDGE_PORT,
                )
            }
            None => command.to_string(),
        };

        format!(
            "{} {} -- /bin/sh -c {}",
            quote(&self.program.to_string_lossy()),
            join(&self.args),
            quote(&inner)
        )
    }
}

/// Builds the `bwrap` options for `config`. Mount order matters: later
/// mounts shadow earlier ones.
pub fn bubblewrap_args(config: &SandboxConfig) -> Vec<String> {
    build_args(config).0
}

/// The `bwrap` options plus the host paths masked before they existed.
fn build_args(config: &SandboxConfig) -> (Vec<String>, Vec<PathBuf>) {
    let mut args: Vec<String> = [
        "--die-with-parent",
        "--unshare-pid",
        "--unshare-net",
        "--ro-bind",
        "/",
        "/",
        "--dev",
        "/dev",
        "--proc",
        "/proc",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let fs = &config.filesystem;

    for root in &fs.allow_write {
        if Path::new(root).exists() {
            args.extend(["--bind".to_string(), root.clone(), root.clone()]);
        } else {
            tracing::debug!("Skipping missing writable root: {}", root);
        }
    }

    // `-try`: another handle may remove its placeholder before we run.
    for path in protected_paths(&fs.allow_write, &fs.deny_write) {
        let path = path.to_string_lossy().into_owned();
        args.extend(["--ro-bind-try".to_string(), path.clone(), path]);
    }

    let placeholders = missing_protected_files(&fs.allow_write, &fs.deny_write);
    for path in &placeholders {
        args.extend([
            "--ro-bind".to_string(),
            "/dev/null".to_string(),
            path.to_string_lossy().into_owned(),
        ]);
    }

    for path in &fs.deny_read {
        let p = Path::new(path);
        if p.is_dir() {
            args.extend(["--tmpfs".to_string(), path.clone()]);
        } else if p.exists() {
            args.extend(["--ro-bind".to_string(), "/dev/null".to_string(), path.clone()]);
        }
    }

    (args, placeholders)
}

/// Existing paths that `deny_write` protects below the writable roots.
///
/// Bind mounts need concrete paths, so `**/<literal>` patterns are resolved
/// against each root (a trailing `/**` protects the directory itself).
/// Other globs cannot be expressed and are skipped.
fn protected_paths(roots: &[String], deny_write: &[String]) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    for pattern in deny_write {
        if !is_glob(pattern) {
            if Path::new(pattern).exists() {
                paths.push(PathBuf::from(pattern));
            }
            continue;
        }

        let Some(rest) = pattern.strip_prefix("**/") else {
            continue;
        };
        let rest = rest.strip_suffix("/**").unwrap_or(rest);
        if is_glob(rest) {
            continue;
        }

        for root in roots {
            let candidate = Path::new(root).join(rest);
            if candidate.exists() && !paths.contains(&candidate) {
                paths.push(candidate);
            }
        }
    }

    paths
}

/// `**/<name>` files that do not exist yet directly below a writable root
/// (or below an existing subdirectory of it). Masking them keeps the child
/// from creating them. Directory patterns and missing parents are skipped.
fn missing_protected_files(roots: &[String], deny_write: &[String]) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    for pattern in deny_write {
        let Some(rest) = pattern.strip_prefix("**/") else {
            continue;
        };
        if rest.ends_with("/**") || is_glob(rest) {
            continue;
        }

        for root in roots {
            let candidate = Path::new(root).join(rest);
            let parent_exists = candidate.parent().is_some_and(Path::is_dir);
            if parent_exists
                && std::fs::symlink_metadata(&candidate).is_err()
                && !paths.contains(&candidate)
            {
                paths.push(candidate);
            }
        }
    }

    paths
}

/// Deletes placeholders `bwrap` left behind. Only empty regular files go,
/// so anything written there from outside the sandbox survives.
fn remove_placeholders(paths: &[PathBuf]) {
    for path in paths {
        let Ok(meta) = std::fs::symlink_metadata(path) else {
            continue;
        };
        if meta.is_file() && meta.len() == 0 {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!("Failed to remove placeholder {}: {}", path.display(), e);
            }
        }
    }
}

/// Locates `bwrap` and checks that it can create the namespaces we need.
/// Unprivileged user namespaces are often disabled in containers.
pub async fn probe() -> Option<PathBuf> {
    let program = which::which("bwrap").ok()?;

    let status = tokio::process::Command::new(&program)
        .args(["--ro-bind", "/", "/", "--unshare-net", "--unshare-pid", "--dev", "/dev", "--proc", "/proc", "--", "/bin/true"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => Some(program),
        Ok(status) => {
            tracing::warn!("bwrap is installed but cannot create namespaces ({})", status);
            None
        }
        Err(e) => {
            tracing::warn!("Failed to run bwrap probe: {}", e);
            None
        }
    }
}

/// True if `socat` is on `PATH`.
pub fn has_socat() -> bool {
    which::which("socat").is_ok()
}
