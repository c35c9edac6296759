//! Sandbox handle construction and lifecycle.
//!
//! [`init_sandbox`] resolves the policy for a project root, picks the
//! confinement mechanism for this host and starts whatever it needs (the
//! filtering proxy, a private directory for the profile or proxy socket).
//! The resulting [`SandboxHandle`] is shared by all sessions, typically as
//! `Arc<SandboxHandle>`.
//!
//! # Lifecycle
//!
//! 1. **Initialization**: platform detection, proxy start, profile generation
//! 2. **Use**: any number of concurrent [`SandboxHandle::wrap_command`] calls
//! 3. **Cleanup**: [`SandboxHandle::cleanup`] stops the proxy and removes the
//!    private directory. It is idempotent and also runs on drop.
//!
//! Hosts without a usable mechanism get a passthrough handle and a warning;
//! that is not an error.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Mutex;
use tempfile::TempDir;

use crate::config::{build_sandbox_config, SandboxConfig};
use crate::network::proxy::{NetworkFilter, ProxyServer};
use crate::sandbox::{Confinement, Passthrough};

/// Resources that live exactly as long as the handle.
struct Ephemeral {
    proxy: Option<ProxyServer>,
    dir: TempDir,
}

/// A selected confinement mechanism plus the resources backing it.
pub struct SandboxHandle {
    confinement: Box<dyn Confinement>,
    config: SandboxConfig,
    filter: Option<NetworkFilter>,
    ephemeral: Mutex<Option<Ephemeral>>,
}

/// Builds the sandbox for `project_root` from the environment and host
/// settings.
///
/// # Errors
///
/// Returns an error if the resolved policy is invalid or if resources for
/// an available mechanism cannot be created (temp directory, proxy bind).
pub async fn init_sandbox(project_root: &Path) -> Result<SandboxHandle> {
    let config = build_sandbox_config(project_root, None);
    SandboxHandle::from_config(config).await
}

impl SandboxHandle {
    /// A handle that confines nothing.
    pub fn passthrough() -> Self {
        Self::passthrough_with(SandboxConfig::disabled())
    }

    fn passthrough_with(config: SandboxConfig) -> Self {
        Self {
            confinement: Box::new(Passthrough),
            config,
            filter: None,
            ephemeral: Mutex::new(None),
        }
    }

    /// Selects and starts a mechanism for an explicit policy.
    pub async fn from_config(config: SandboxConfig) -> Result<Self> {
        if config.disabled {
            tracing::info!("Sandbox disabled, commands run unconfined");
            return Ok(Self::passthrough_with(config));
        }

        config.validate().context("Invalid sandbox configuration")?;

        #[cfg(unix)]
        {
            if cfg!(target_os = "macos") {
                if crate::sandbox::macos::is_available() {
                    return Self::start_seatbelt(config).await;
                }
                tracing::warn!("sandbox-exec not found, commands run unconfined");
            } else if cfg!(target_os = "linux") {
                if let Some(bwrap) = crate::sandbox::linux::probe().await {
                    return Self::start_bubblewrap(config, bwrap).await;
                }
                tracing::warn!("Bubblewrap unavailable, commands run unconfined");
            } else {
                tracing::warn!(
                    "No sandbox mechanism for {}, commands run unconfined",
                    std::env::consts::OS
                );
            }
        }

        #[cfg(not(unix))]
        tracing::warn!(
            "No sandbox mechanism for {}, commands run unconfined",
            std::env::consts::OS
        );

        Ok(Self::passthrough_with(config))
    }

    #[cfg(unix)]
    async fn start_seatbelt(config: SandboxConfig) -> Result<Self> {
        use crate::sandbox::macos::{generate_seatbelt_profile, Seatbelt};

        let dir = private_dir()?;
        let filter = NetworkFilter::new(config.network.allowed_domains.clone());
        let proxy = filter
            .start(0)
            .await
            .context("Failed to start network filtering proxy")?;

        let profile = generate_seatbelt_profile(&config, Some(proxy.addr().port()));
        tracing::debug!("Generated Seatbelt profile:\n{}", profile);

        let profile_path = dir.path().join("profile.sb");
        std::fs::write(&profile_path, &profile).context("Failed to write Seatbelt profile")?;

        tracing::info!("Sandbox: seatbelt, proxy on {}", proxy.addr());
        let seatbelt = Seatbelt::new(profile_path, Some(proxy.url()));

        Ok(Self {
            confinement: Box::new(seatbelt),
            config,
            filter: Some(filter),
            ephemeral: Mutex::new(Some(Ephemeral {
                proxy: Some(proxy),
                dir,
            })),
        })
    }

    #[cfg(unix)]
    async fn start_bubblewrap(config: SandboxConfig, bwrap: std::path::PathBuf) -> Result<Self> {
        use crate::sandbox::linux::{has_socat, Bubblewrap};

        let dir = private_dir()?;

        let (filter, proxy, socket) = if has_socat() {
            let filter = NetworkFilter::new(config.network.allowed_domains.clone());
            let mut proxy = filter
                .start(0)
                .await
                .context("Failed to start network filtering proxy")?;
            let socket = dir.path().join("proxy.sock");
            proxy.listen_unix(&socket, &filter)?;
            (Some(filter), Some(proxy), Some(socket))
        } else {
            tracing::warn!("socat not found, sandboxed commands have no network access");
            (None, None, None)
        };

        let bubblewrap = Bubblewrap::new(bwrap, &config, socket);
        tracing::info!("Sandbox: bubblewrap");

        Ok(Self {
            confinement: Box::new(bubblewrap),
            config,
            filter,
            ephemeral: Mutex::new(Some(Ephemeral { proxy, dir })),
        })
    }

    /// Whether commands are actually confined.
    pub fn sandboxed(&self) -> bool {
        self.confinement.sandboxed()
    }

    /// `"seatbelt"`, `"bubblewrap"` or `"none"`.
    pub fn mechanism(&self) -> &'static str {
        self.confinement.mechanism()
    }

    /// The policy this handle enforces.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Wraps a shell command line so it runs confined. Identity for a
    /// passthrough handle.
    pub fn wrap_command(&self, command: &str) -> String {
        let wrapped = self.confinement.wrap_command(command);
        tracing::debug!("Wrapped command: {}", wrapped);
        wrapped
    }

    /// Replaces the proxy allow-list; affects new connections only.
    pub fn update_network_rules(&self, domains: Vec<String>) {
        match &self.filter {
            Some(filter) => filter.update_allowed_domains(domains),
            None => tracing::warn!(
                "Attempted to update network rules, but no filtering proxy is running"
            ),
        }
    }

    /// Stops the proxy and removes the private directory. Safe to call any
    /// number of times.
    pub fn cleanup(&self) {
        let taken = match self.ephemeral.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(Ephemeral { proxy, dir }) = taken {
            if let Some(mut proxy) = proxy {
                proxy.shutdown();
            }
            self.confinement.release();
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::debug!("Failed to remove sandbox directory {}: {}", path.display(), e);
            }
            tracing::info!("Sandbox cleaned up");
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("mechanism", &self.mechanism())
            .field("sandboxed", &self.sandboxed())
            .finish()
    }
}

fn private_dir() -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix("polyrun-sandbox-")
        .tempdir()
        .context("Failed to create sandbox directory")
}
