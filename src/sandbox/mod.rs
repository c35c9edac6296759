//! OS-level confinement for executed code.
//!
//! | Platform | Technology | Implementation |
//! |----------|-----------|----------------|
//! | macOS | Seatbelt (TrustedBSD MAC) | [`macos::Seatbelt`] |
//! | Linux | Bubblewrap namespaces | [`linux::Bubblewrap`] |
//! | anything else, or tool missing | none | [`Passthrough`] |
//!
//! The mechanism is chosen once by [`init_sandbox`]; afterwards every
//! session only calls [`SandboxHandle::wrap_command`], which turns a shell
//! command line into one that runs the same command under confinement.
//!
//! ```no_run
//! use polyrun::sandbox::init_sandbox;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let handle = init_sandbox(std::path::Path::new("/work/project")).await?;
//! println!("{} -> {}", handle.mechanism(), handle.wrap_command("echo hi"));
//! handle.cleanup();
//! # Ok(())
//! # }
//! ```

#[cfg(unix)]
pub mod linux;
#[cfg(unix)]
pub mod macos;

pub mod manager;

pub use manager::{init_sandbox, SandboxHandle};

/// A way of confining a shell command line.
pub trait Confinement: Send + Sync {
    /// Short name for logs and diagnostics.
    fn mechanism(&self) -> &'static str;

    /// Whether commands are actually confined.
    fn sandboxed(&self) -> bool {
        true
    }

    /// Wraps `command` (a `/bin/sh -c` command line) so that it runs
    /// confined. The result is again a shell command line.
    fn wrap_command(&self, command: &str) -> String;

    /// Removes whatever the mechanism left behind on the host. Runs once,
    /// from [`SandboxHandle::cleanup`].
    fn release(&self) {}
}

/// No confinement: commands pass through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Confinement for Passthrough {
    fn mechanism(&self) -> &'static str {
        "none"
    }

    fn sandboxed(&self) -> bool {
        false
    }

    fn wrap_command(&self, command: &str) -> String {
        command.to_string()
    }
}
