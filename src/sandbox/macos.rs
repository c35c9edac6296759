//! macOS Seatbelt confinement.
//!
//! Seatbelt is Apple's mandatory access control framework. A profile in
//! S-expression syntax is written once per sandbox handle and every
//! command is started through `sandbox-exec -f <profile>`.
//!
//! # Profile Structure
//!
//! The profile starts permissive and then narrows:
//! - all writes denied, except the configured writable roots and a few
//!   character devices
//! - sensitive files write-protected even inside writable roots
//! - credential directories unreadable
//! - network denied except the filtering proxy on loopback
//!
//! # Security Features
//!
//! ## Move-Blocking
//!
//! Unreadable paths are also write-protected, so they cannot be renamed
//! into a readable location:
//!
//! ```text
//! Attack: mv ~/.ssh /tmp/keys
//! Defense: deny file-write* on every denyRead path
//! ```
//!
//! ## Network Isolation
//!
//! Outbound connections are allowed to the proxy port on loopback only.
//! Domain filtering happens in the proxy, not in Seatbelt.

use std::path::{Path, PathBuf};

use crate::config::SandboxConfig;
use crate::network::proxy::proxy_env;
use crate::sandbox::Confinement;
use crate::utils::glob::{glob_to_regex, is_glob};
use crate::utils::shell::quote;

/// Character devices every program may write to.
const WRITABLE_DEVICES: &[&str] = &["/dev/null", "/dev/zero", "/dev/tty", "/dev/stdout", "/dev/stderr"];

/// Commands run under `sandbox-exec` with a pre-generated profile.
#[derive(Debug, Clone)]
pub struct Seatbelt {
    profile_path: PathBuf,
    proxy_url: Option<String>,
}

impl Seatbelt {
    /// `profile_path` must stay on disk for as long as commands are wrapped.
    pub fn new(profile_path: PathBuf, proxy_url: Option<String>) -> Self {
        Self {
            profile_path,
            proxy_url,
        }
    }
}

impl Confinement for Seatbelt {
    fn mechanism(&self) -> &'static str {
        "seatbelt"
    }

    fn wrap_command(&self, command: &str) -> String {
        let mut wrapped = Vec::new();
        if let Some(url) = &self.proxy_url {
            wrapped.push("env".to_string());
            wrapped.extend(proxy_env(url).into_iter().map(|kv| quote(&kv)));
        }
        wrapped.push("sandbox-exec".to_string());
        wrapped.push("-f".to_string());
        wrapped.push(quote(&self.profile_path.to_string_lossy()));
        wrapped.push("/bin/sh".to_string());
        wrapped.push("-c".to_string());
        wrapped.push(quote(command));
        wrapped.join(" ")
    }
}

/// True if `sandbox-exec` is on `PATH`.
pub fn is_available() -> bool {
    which::which("sandbox-exec").is_ok()
}

/// Generates a Seatbelt profile from sandbox configuration.
///
/// `proxy_port` is the loopback port of the filtering proxy; `None` blocks
/// the network entirely.
///
/// # Generated Profile Example
///
/// ```scheme
/// (version 1)
/// (allow default)
///
/// (deny file-write* (subpath "/"))
/// (allow file-write* (subpath "/work/project"))
/// (deny file-write* (regex #"^.*/\.env$"))
/// (deny file-read* (subpath "/Users/me/.ssh"))
///
/// (deny network*)
/// (allow network-outbound (remote ip "localhost:54321"))
/// ```
pub fn generate_seatbelt_profile(config: &SandboxConfig, proxy_port: Option<u16>) -> String {
    let mut profile = String::new();

    profile.push_str("(version 1)\n");
    profile.push_str(";; Default policy: allow operations unless explicitly denied\n");
    profile.push_str("(allow default)\n\n");

    profile.push_str(&generate_file_write_rules(config));
    profile.push_str(&generate_file_read_rules(config));
    profile.push_str(&generate_move_blocking_rules(config));
    profile.push_str(&generate_network_rules(proxy_port));

    profile
}

fn section(title: &str) -> String {
    format!(
        ";; ============================================================\n\
         ;; {}\n\
         ;; ============================================================\n",
        title
    )
}

fn generate_file_write_rules(config: &SandboxConfig) -> String {
    let mut rules = section("FILE WRITE RESTRICTIONS");

    rules.push_str("(deny file-write*\n  (subpath \"/\"))\n\n");

    for device in WRITABLE_DEVICES {
        rules.push_str(&format!("(allow file-write*\n  (literal {}))\n", sbpl_string(device)));
    }
    rules.push_str("(allow file-write*\n  (subpath \"/dev/fd\"))\n\n");

    if !config.filesystem.allow_write.is_empty() {
        rules.push_str(";; Writable roots\n");
        for path in &config.filesystem.allow_write {
            // Seatbelt matches resolved paths, so /tmp must also appear as /private/tmp.
            for variant in path_variants(path) {
                rules.push_str(&format!("(allow file-write*\n  (subpath {}))\n", sbpl_string(&variant)));
            }
        }
        rules.push('\n');
    }

    if !config.filesystem.deny_write.is_empty() {
        rules.push_str(";; Write-protected even inside writable roots\n");
        for pattern in &config.filesystem.deny_write {
            rules.push_str(&path_rule("deny file-write*", pattern));
        }
        rules.push('\n');
    }

    rules
}

fn generate_file_read_rules(config: &SandboxConfig) -> String {
    if config.filesystem.deny_read.is_empty() {
        return String::new();
    }

    let mut rules = section("FILE READ RESTRICTIONS");
    for path in &config.filesystem.deny_read {
        rules.push_str(&path_rule("deny file-read*", path));
    }
    rules.push('\n');
    rules
}

fn generate_move_blocking_rules(config: &SandboxConfig) -> String {
    if config.filesystem.deny_read.is_empty() {
        return String::new();
    }

    let mut rules = section("MOVE-BLOCKING RULES");
    for path in &config.filesystem.deny_read {
        rules.push_str(&path_rule("deny file-write*", path));
    }
    rules.push('\n');
    rules
}

fn generate_network_rules(proxy_port: Option<u16>) -> String {
    let mut rules = section("NETWORK RESTRICTIONS");

    rules.push_str("(deny network*)\n");
    match proxy_port {
        Some(port) => {
            rules.push_str(&format!(
                "(allow network-outbound\n  (remote ip \"localhost:{}\"))\n",
                port
            ));
            rules.push_str("(allow network-outbound\n  (remote unix-socket))\n");
        }
        None => rules.push_str(";; No proxy: network fully blocked\n"),
    }
    rules.push('\n');

    rules
}

/// `(<action> (subpath ...))` for literal paths, `(regex ...)` for globs.
fn path_rule(action: &str, pattern: &str) -> String {
    if is_glob(pattern) {
        // Only patterns that compile as a regex reach the profile.
        match glob_to_regex(pattern) {
            Ok(regex) => format!("({}\n  (regex #\"{}\"))\n", action, regex.as_str().replace('"', "\\\"")),
            Err(e) => {
                tracing::warn!("Skipping invalid sandbox pattern {}: {}", pattern, e);
                format!(";; Skipped invalid glob pattern: {}\n", pattern.replace('\n', " "))
            }
        }
    } else {
        path_variants(pattern)
            .iter()
            .map(|p| format!("({}\n  (subpath {}))\n", action, sbpl_string(p)))
            .collect()
    }
}

/// The path as written, plus its canonical form when that differs.
fn path_variants(path: &str) -> Vec<String> {
    let mut variants = vec![path.to_string()];
    if let Ok(canonical) = std::fs::canonicalize(Path::new(path)) {
        let canonical = canonical.to_string_lossy().into_owned();
        if canonical != path {
            variants.push(canonical);
        }
    }
    variants
}

/// Quotes a string literal for SBPL.
fn sbpl_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}
