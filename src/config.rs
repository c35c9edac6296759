//! Sandbox policy construction.
//!
//! A [`SandboxConfig`] describes what a sandboxed child may read, write and
//! connect to. It is derived once per project root by
//! [`build_sandbox_config`], in this order of precedence:
//!
//! 1. `POLYRUN_NO_SANDBOX` (truthy) disables the sandbox entirely and leaves
//!    every policy list empty.
//! 2. The filesystem policy is fixed: writes are allowed in the project root
//!    and the shared temp directory, sensitive dotfiles are write-protected,
//!    and credential directories under the home directory are unreadable.
//! 3. The network allow-list comes from `POLYRUN_ALLOWED_DOMAINS`, else from
//!    the host settings file `~/.polyrun/settings.json`, else from a built-in
//!    list of package registries and code hosts.
//!
//! The network model is allow-list only: `denied_domains` is always empty.
//!
//! # Settings file
//!
//! Both of these shapes are accepted; the first wins when both are present.
//!
//! ```json
//! { "sandbox": { "network": { "allowedDomains": ["github.com"] } } }
//! { "sandbox": { "allowedDomains": ["github.com"] } }
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Disables sandboxing when set to `1`, `true`, `yes` or `on`.
pub const NO_SANDBOX_ENV: &str = "POLYRUN_NO_SANDBOX";

/// Comma-separated network allow-list override.
pub const ALLOWED_DOMAINS_ENV: &str = "POLYRUN_ALLOWED_DOMAINS";

/// Settings file location relative to the home directory.
pub const SETTINGS_FILE: &str = ".polyrun/settings.json";

/// Write-protected even inside writable directories.
pub const DEFAULT_DENY_WRITE: &[&str] = &[
    "**/.env",
    "**/.env.*",
    "**/.git/hooks/**",
    "**/.git/config",
    "**/.gitconfig",
    "**/.npmrc",
    "**/.pypirc",
    "**/.netrc",
    "**/.bashrc",
    "**/.bash_profile",
    "**/.zshrc",
    "**/.profile",
];

/// Credential locations under the home directory that may not be read.
pub const DEFAULT_DENY_READ: &[&str] = &[
    ".ssh",
    ".aws",
    ".gnupg",
    ".config/gcloud",
    ".azure",
    ".kube",
    ".docker/config.json",
];

/// Package registries and code-hosting APIs reachable by default.
pub const DEFAULT_ALLOWED_DOMAINS: &[&str] = &[
    "registry.npmjs.org",
    "registry.yarnpkg.com",
    "pypi.org",
    "files.pythonhosted.org",
    "crates.io",
    "*.crates.io",
    "rubygems.org",
    "proxy.golang.org",
    "sum.golang.org",
    "github.com",
    "api.github.com",
    "*.githubusercontent.com",
    "gitlab.com",
    "bitbucket.org",
];

/// Filesystem access rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemConfig {
    /// Paths whose contents may not be read.
    #[serde(default)]
    pub deny_read: Vec<String>,

    /// The only locations writes may land in.
    #[serde(default)]
    pub allow_write: Vec<String>,

    /// Patterns write-protected even inside `allow_write`.
    #[serde(default)]
    pub deny_write: Vec<String>,
}

/// Network access rules. Always allow-list based.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Domains the filtering proxy lets through; `*.example.com` style
    /// wildcards are supported.
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    /// Kept for schema compatibility; never populated.
    #[serde(default)]
    pub denied_domains: Vec<String>,
}

/// Complete sandbox policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub filesystem: FilesystemConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

/// Environment inputs to policy resolution, captured once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub no_sandbox: bool,
    pub allowed_domains: Option<Vec<String>>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            no_sandbox: std::env::var(NO_SANDBOX_ENV)
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
            allowed_domains: std::env::var(ALLOWED_DOMAINS_ENV)
                .ok()
                .and_then(|v| parse_domain_list(&v)),
        }
    }
}

impl SandboxConfig {
    /// A disabled policy with every list empty.
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::default()
        }
    }

    /// Serializes the policy as pretty JSON.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize configuration to JSON")
    }

    /// Checks every path and domain entry.
    ///
    /// # Errors
    ///
    /// Returns an error for empty entries, entries containing NUL bytes,
    /// domains with characters outside `[A-Za-z0-9.-*]`, or a non-empty
    /// `denied_domains`.
    pub fn validate(&self) -> Result<()> {
        let fs = &self.filesystem;
        for (kind, paths) in [
            ("denyRead", &fs.deny_read),
            ("allowWrite", &fs.allow_write),
            ("denyWrite", &fs.deny_write),
        ] {
            for path in paths {
                validate_path_string(path)
                    .with_context(|| format!("Invalid {} path: {}", kind, path))?;
            }
        }

        for domain in &self.network.allowed_domains {
            validate_domain_string(domain)
                .with_context(|| format!("Invalid domain pattern: {}", domain))?;
        }

        if !self.network.denied_domains.is_empty() {
            return Err(anyhow!("deniedDomains is not supported; use allowedDomains"));
        }

        Ok(())
    }
}

/// Builds the sandbox policy for `project_root`.
///
/// `home_override` replaces the real home directory, both for the
/// credential deny-list and for locating the settings file.
pub fn build_sandbox_config(project_root: &Path, home_override: Option<&Path>) -> SandboxConfig {
    let home = home_override.map(Path::to_path_buf).or_else(dirs::home_dir);
    resolve_sandbox_config(project_root, home.as_deref(), &EnvOverrides::from_env())
}

/// Pure policy resolution over explicit inputs.
pub fn resolve_sandbox_config(
    project_root: &Path,
    home: Option<&Path>,
    env: &EnvOverrides,
) -> SandboxConfig {
    if env.no_sandbox {
        tracing::info!("Sandbox disabled via {}", NO_SANDBOX_ENV);
        return SandboxConfig::disabled();
    }

    let filesystem = FilesystemConfig {
        deny_read: home
            .map(|home| {
                DEFAULT_DENY_READ
                    .iter()
                    .map(|rel| path_string(&home.join(rel)))
                    .collect()
            })
            .unwrap_or_default(),
        allow_write: vec![path_string(project_root), path_string(&std::env::temp_dir())],
        deny_write: DEFAULT_DENY_WRITE.iter().map(|p| p.to_string()).collect(),
    };

    let allowed_domains = if let Some(domains) = &env.allowed_domains {
        tracing::debug!("Network allow-list from {}", ALLOWED_DOMAINS_ENV);
        domains.clone()
    } else if let Some(domains) = home.and_then(read_settings_domains) {
        tracing::debug!("Network allow-list from settings file");
        domains
    } else {
        DEFAULT_ALLOWED_DOMAINS.iter().map(|d| d.to_string()).collect()
    };

    SandboxConfig {
        disabled: false,
        filesystem,
        network: NetworkConfig {
            allowed_domains,
            denied_domains: Vec::new(),
        },
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    #[serde(default)]
    sandbox: Option<SandboxSettings>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxSettings {
    #[serde(default)]
    network: Option<NetworkSettings>,
    /// Older flat shape.
    #[serde(default)]
    allowed_domains: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkSettings {
    #[serde(default)]
    allowed_domains: Option<Vec<String>>,
}

/// Reads the allow-list from `<home>/.polyrun/settings.json`. Missing or
/// malformed files yield `None`.
fn read_settings_domains(home: &Path) -> Option<Vec<String>> {
    let path = home.join(SETTINGS_FILE);
    let content = std::fs::read_to_string(&path).ok()?;
    parse_settings_domains(&content).or_else(|| {
        tracing::debug!("Ignoring settings file without a usable allow-list: {}", path.display());
        None
    })
}

fn parse_settings_domains(json: &str) -> Option<Vec<String>> {
    let settings: SettingsFile = serde_json::from_str(json).ok()?;
    let sandbox = settings.sandbox?;
    sandbox
        .network
        .and_then(|n| n.allowed_domains)
        .or(sandbox.allowed_domains)
}

/// Splits a comma-separated list; `None` if nothing remains after trimming.
fn parse_domain_list(value: &str) -> Option<Vec<String>> {
    let domains: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(String::from)
        .collect();
    (!domains.is_empty()).then_some(domains)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn validate_path_string(path: &str) -> Result<()> {
    if path.contains('\0') {
        return Err(anyhow!("Path contains null bytes"));
    }
    if path.is_empty() {
        return Err(anyhow!("Path cannot be empty"));
    }
    Ok(())
}

fn validate_domain_string(domain: &str) -> Result<()> {
    if domain.is_empty() {
        return Err(anyhow!("Domain cannot be empty"));
    }
    if let Some(ch) = domain
        .chars()
        .find(|ch| !ch.is_ascii_alphanumeric() && !matches!(ch, '.' | '-' | '*'))
    {
        return Err(anyhow!("Domain contains invalid character: {:?}", ch));
    }
    Ok(())
}
