//! Runtime registry: which language toolchains exist on this host, and how
//! to invoke them.
//!
//! Detection is an explicit call producing a [`RuntimeMap`] snapshot. Nothing
//! is cached behind the caller's back; compose the map once and pass it to
//! the [`Executor`](crate::executor::Executor).
//!
//! ```no_run
//! use polyrun::runtime::{build_command, detect_runtimes, Language};
//! use std::path::Path;
//!
//! let runtimes = detect_runtimes();
//! let invocation = build_command(&runtimes, Language::Python, Path::new("/tmp/script.py"))?;
//! # Ok::<(), polyrun::error::ExecError>(())
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{ExecError, Result};

/// Languages the engine can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Language {
    JavaScript,
    TypeScript,
    Python,
    Shell,
    Ruby,
    Go,
    Rust,
    Php,
    Perl,
    R,
    Elixir,
}

impl Language {
    pub const ALL: [Language; 11] = [
        Language::JavaScript,
        Language::TypeScript,
        Language::Python,
        Language::Shell,
        Language::Ruby,
        Language::Go,
        Language::Rust,
        Language::Php,
        Language::Perl,
        Language::R,
        Language::Elixir,
    ];

    /// Canonical lower-case identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Python => "python",
            Language::Shell => "shell",
            Language::Ruby => "ruby",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::Php => "php",
            Language::Perl => "perl",
            Language::R => "r",
            Language::Elixir => "elixir",
        }
    }

    /// Extension used for the materialized script file.
    pub fn file_extension(self) -> &'static str {
        match self {
            Language::JavaScript => "js",
            Language::TypeScript => "ts",
            Language::Python => "py",
            Language::Shell => "sh",
            Language::Ruby => "rb",
            Language::Go => "go",
            Language::Rust => "rs",
            Language::Php => "php",
            Language::Perl => "pl",
            Language::R => "R",
            Language::Elixir => "exs",
        }
    }

    /// Toolchain named in "not available" errors.
    pub fn toolchain_name(self) -> &'static str {
        match self {
            Language::JavaScript => "node",
            Language::TypeScript => "bun, tsx or ts-node",
            Language::Python => "python3",
            Language::Shell => "bash",
            Language::Ruby => "ruby",
            Language::Go => "go",
            Language::Rust => "rustc",
            Language::Php => "php",
            Language::Perl => "perl",
            Language::R => "Rscript",
            Language::Elixir => "elixir",
        }
    }

    pub fn install_hint(self) -> &'static str {
        match self {
            Language::JavaScript => "Install Node.js (https://nodejs.org/) or Bun (https://bun.sh/).",
            Language::TypeScript => "Install Bun (https://bun.sh/) or run `npm install -g tsx`.",
            Language::Python => "Install Python 3 (https://www.python.org/downloads/).",
            Language::Shell => "Install bash or provide a POSIX sh.",
            Language::Ruby => "Install Ruby (https://www.ruby-lang.org/en/documentation/installation/).",
            Language::Go => "Install Go (https://go.dev/dl/).",
            Language::Rust => "Install Rust via rustup (https://rustup.rs/).",
            Language::Php => "Install PHP (https://www.php.net/downloads).",
            Language::Perl => "Install Perl (https://www.perl.org/get.html).",
            Language::R => "Install R (https://cran.r-project.org/) so that Rscript is on PATH.",
            Language::Elixir => "Install Elixir (https://elixir-lang.org/install.html).",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self> {
        let language = match s.trim().to_ascii_lowercase().as_str() {
            "javascript" | "js" | "node" | "nodejs" => Language::JavaScript,
            "typescript" | "ts" => Language::TypeScript,
            "python" | "py" | "python3" => Language::Python,
            "shell" | "sh" | "bash" => Language::Shell,
            "ruby" | "rb" => Language::Ruby,
            "go" | "golang" => Language::Go,
            "rust" | "rs" => Language::Rust,
            "php" => Language::Php,
            "perl" | "pl" => Language::Perl,
            "r" | "rscript" => Language::R,
            "elixir" | "ex" | "exs" => Language::Elixir,
            _ => return Err(ExecError::UnsupportedLanguage(s.to_string())),
        };
        Ok(language)
    }
}

/// A concrete, resolved toolchain. One variant per way of invoking a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Toolchain {
    Bun(PathBuf),
    Node(PathBuf),
    Tsx(PathBuf),
    TsNode(PathBuf),
    Python(PathBuf),
    Shell(PathBuf),
    Ruby(PathBuf),
    GoRun(PathBuf),
    Rustc(PathBuf),
    Php(PathBuf),
    Perl(PathBuf),
    Rscript(PathBuf),
    Elixir(PathBuf),
}

/// Argument vectors for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Single(Vec<String>),
    /// Compile step followed by a run step. Both share one timeout and one
    /// output budget.
    CompileThenRun {
        compile: Vec<String>,
        run: Vec<String>,
    },
}

impl Invocation {
    pub fn steps(&self) -> Vec<&[String]> {
        match self {
            Invocation::Single(argv) => vec![argv.as_slice()],
            Invocation::CompileThenRun { compile, run } => vec![compile.as_slice(), run.as_slice()],
        }
    }
}

impl Toolchain {
    pub fn program(&self) -> &Path {
        match self {
            Toolchain::Bun(p)
            | Toolchain::Node(p)
            | Toolchain::Tsx(p)
            | Toolchain::TsNode(p)
            | Toolchain::Python(p)
            | Toolchain::Shell(p)
            | Toolchain::Ruby(p)
            | Toolchain::GoRun(p)
            | Toolchain::Rustc(p)
            | Toolchain::Php(p)
            | Toolchain::Perl(p)
            | Toolchain::Rscript(p)
            | Toolchain::Elixir(p) => p,
        }
    }

    /// Builds the argv that runs `script`.
    pub fn invocation(&self, script: &Path) -> Invocation {
        let program = path_arg(self.program());
        let script_arg = path_arg(script);

        match self {
            Toolchain::Bun(_) => Invocation::Single(vec![program, "run".to_string(), script_arg]),
            Toolchain::GoRun(_) => Invocation::Single(vec![program, "run".to_string(), script_arg]),
            Toolchain::Rustc(_) => {
                let binary = path_arg(&script.with_extension(std::env::consts::EXE_EXTENSION));
                Invocation::CompileThenRun {
                    compile: vec![
                        program,
                        "--edition".to_string(),
                        "2021".to_string(),
                        script_arg,
                        "-o".to_string(),
                        binary.clone(),
                    ],
                    run: vec![binary],
                }
            }
            Toolchain::Node(_)
            | Toolchain::Tsx(_)
            | Toolchain::TsNode(_)
            | Toolchain::Python(_)
            | Toolchain::Shell(_)
            | Toolchain::Ruby(_)
            | Toolchain::Php(_)
            | Toolchain::Perl(_)
            | Toolchain::Rscript(_)
            | Toolchain::Elixir(_) => Invocation::Single(vec![program, script_arg]),
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Snapshot of the toolchains found on this host.
#[derive(Debug, Clone, Default)]
pub struct RuntimeMap {
    entries: BTreeMap<Language, Option<Toolchain>>,
}

impl RuntimeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, language: Language, toolchain: Option<Toolchain>) {
        self.entries.insert(language, toolchain);
    }

    pub fn get(&self, language: Language) -> Option<&Toolchain> {
        self.entries.get(&language).and_then(Option::as_ref)
    }

    /// Like [`get`](Self::get), but a missing toolchain is an error naming
    /// it and how to install it.
    pub fn require(&self, language: Language) -> Result<&Toolchain> {
        self.get(language).ok_or(ExecError::RuntimeUnavailable {
            language,
            toolchain: language.toolchain_name(),
            hint: language.install_hint(),
        })
    }

    pub fn is_available(&self, language: Language) -> bool {
        self.get(language).is_some()
    }

    /// Languages with a resolved toolchain, in declaration order.
    pub fn available(&self) -> Vec<Language> {
        self.entries
            .iter()
            .filter_map(|(language, toolchain)| toolchain.as_ref().map(|_| *language))
            .collect()
    }
}

/// Probes `PATH` for every supported language.
pub fn detect_runtimes() -> RuntimeMap {
    let map = detect_with(|name| which::which(name).ok());
    tracing::debug!("Detected runtimes: {:?}", map.available());
    map
}

/// Detection against an arbitrary lookup; `lookup` maps a binary name to
/// its path when present.
pub fn detect_with(lookup: impl Fn(&str) -> Option<PathBuf>) -> RuntimeMap {
    let mut map = RuntimeMap::new();

    // JavaScript is always present: prefer bun, otherwise assume node.
    let javascript = match lookup("bun") {
        Some(bun) => Toolchain::Bun(bun),
        None => Toolchain::Node(lookup("node").unwrap_or_else(|| PathBuf::from("node"))),
    };
    map.insert(Language::JavaScript, Some(javascript));

    let typescript = first_of(&lookup, &["bun", "tsx", "ts-node"]).map(|(name, path)| match name {
        "bun" => Toolchain::Bun(path),
        "tsx" => Toolchain::Tsx(path),
        _ => Toolchain::TsNode(path),
    });
    map.insert(Language::TypeScript, typescript);

    map.insert(
        Language::Python,
        first_of(&lookup, &["python3", "python"]).map(|(_, path)| Toolchain::Python(path)),
    );

    // Shell is always present: bash, falling back to sh.
    let shell = lookup("bash")
        .or_else(|| lookup("sh"))
        .unwrap_or_else(|| PathBuf::from("sh"));
    map.insert(Language::Shell, Some(Toolchain::Shell(shell)));

    map.insert(Language::Ruby, lookup("ruby").map(Toolchain::Ruby));
    map.insert(Language::Go, lookup("go").map(Toolchain::GoRun));
    map.insert(Language::Rust, lookup("rustc").map(Toolchain::Rustc));
    map.insert(Language::Php, lookup("php").map(Toolchain::Php));
    map.insert(Language::Perl, lookup("perl").map(Toolchain::Perl));
    map.insert(Language::R, lookup("Rscript").map(Toolchain::Rscript));
    map.insert(Language::Elixir, lookup("elixir").map(Toolchain::Elixir));

    map
}

fn first_of(
    lookup: &impl Fn(&str) -> Option<PathBuf>,
    names: &[&'static str],
) -> Option<(&'static str, PathBuf)> {
    names
        .iter()
        .find_map(|name| lookup(*name).map(|path| (*name, path)))
}

/// Builds the invocation for `file` without spawning anything.
///
/// # Errors
///
/// [`ExecError::RuntimeUnavailable`] when the map has no toolchain for
/// `language`.
pub fn build_command(map: &RuntimeMap, language: Language, file: &Path) -> Result<Invocation> {
    Ok(map.require(language)?.invocation(file))
}
