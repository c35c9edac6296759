//! Writing source code to disk before it runs.
//!
//! Inline code goes to `script.<ext>` in a fresh scratch directory. In file
//! mode the target file's path is handed to the child through the
//! `FILE_CONTENT_PATH` environment variable, and a short per-language
//! preamble reads it into a `FILE_CONTENT` binding (`file_content` in
//! Elixir, where capitalised names are module aliases). The path itself is
//! never spliced into source code or shell syntax, so quotes, backticks and
//! `$` in it are harmless.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::{ExecError, Result};
use crate::runtime::Language;

/// Environment variable carrying the file-mode target path.
pub const FILE_CONTENT_ENV: &str = "FILE_CONTENT_PATH";

/// A script on disk. The scratch directory is removed on drop.
#[derive(Debug)]
pub struct Script {
    dir: TempDir,
    path: PathBuf,
    env: Vec<(String, String)>,
}

impl Script {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Extra environment for the child.
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }
}

/// Writes `code` as a runnable script. `target` is the resolved file-mode
/// path, whose contents get bound to `FILE_CONTENT`.
pub fn materialize(language: Language, code: &str, target: Option<&Path>) -> Result<Script> {
    let dir = tempfile::Builder::new()
        .prefix("polyrun-")
        .tempdir()
        .map_err(ExecError::Materialize)?;

    let mut source = normalize(language, code);
    let mut env = Vec::new();
    if let Some(target) = target {
        // Absolute, so it means the same thing from the scratch directory.
        let target = std::path::absolute(target).map_err(ExecError::Materialize)?;
        source = with_file_content(language, &source);
        env.push((FILE_CONTENT_ENV.to_string(), target.to_string_lossy().into_owned()));
    }

    let path = dir.path().join(format!("script.{}", language.file_extension()));
    std::fs::write(&path, source).map_err(ExecError::Materialize)?;
    tracing::debug!("Materialized {} script at {}", language, path.display());

    Ok(Script { dir, path, env })
}

/// Relative paths resolve against `project_root`; absolute paths are kept.
pub fn resolve_source_path(project_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root.join(path)
    }
}

/// Checks that the file-mode target is readable.
pub fn check_readable(path: &Path) -> Result<()> {
    std::fs::File::open(path)
        .and_then(|f| f.metadata())
        .and_then(|m| {
            if m.is_dir() {
                Err(std::io::Error::other("is a directory"))
            } else {
                Ok(())
            }
        })
        .map_err(|source| ExecError::SourceUnreadable {
            path: path.to_path_buf(),
            source,
        })
}

/// Makes snippets runnable: Go and Rust need an entry point, PHP an
/// opening tag.
pub fn normalize(language: Language, code: &str) -> String {
    match language {
        Language::Go if !has_package_clause(code) => format!(
            "package main\n\nimport \"fmt\"\n\nvar _ = fmt.Sprint\n\nfunc main() {{\n{}\n}}\n",
            code
        ),
        Language::Rust if !has_rust_main(code) => format!("fn main() {{\n{}\n}}\n", code),
        Language::Php if !code.trim_start().starts_with("<?") => format!("<?php\n{}", code),
        _ => code.to_string(),
    }
}

fn has_package_clause(code: &str) -> bool {
    code.lines().any(|line| line.trim_start().starts_with("package "))
}

/// Looks for `fn main(` with arbitrary whitespace between the tokens.
fn has_rust_main(code: &str) -> bool {
    code.match_indices("fn").any(|(at, _)| {
        let boundary = code[..at]
            .chars()
            .next_back()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '_'));
        let rest = &code[at + 2..];
        if !boundary || !rest.starts_with(char::is_whitespace) {
            return false;
        }
        rest.trim_start()
            .strip_prefix("main")
            .is_some_and(|after| after.trim_start().starts_with('('))
    })
}

fn with_file_content(language: Language, code: &str) -> String {
    match language {
        Language::JavaScript | Language::TypeScript => format!(
            "const FILE_CONTENT = require(\"fs\").readFileSync(process.env.{}, \"utf8\");\n{}",
            FILE_CONTENT_ENV, code
        ),
        Language::Python => {
            let preamble = format!(
                "import os as _fc_os\nwith open(_fc_os.environ[\"{}\"], encoding=\"utf-8\", errors=\"replace\") as _fc_file:\n    FILE_CONTENT = _fc_file.read()\n",
                FILE_CONTENT_ENV
            );
            insert_at(code, python_header_end(code), &preamble)
        }
        Language::Shell => format!("FILE_CONTENT=$(cat -- \"${}\")\n{}", FILE_CONTENT_ENV, code),
        Language::Ruby => format!("FILE_CONTENT = File.read(ENV.fetch(\"{}\"))\n{}", FILE_CONTENT_ENV, code),
        Language::Go => {
            // Imports must precede declarations, so the import goes right
            // after the package clause and the variable at the end.
            let import = "import _fc_os \"os\"\n";
            let var = format!(
                "\nvar FILE_CONTENT = func() string {{ b, _ := _fc_os.ReadFile(_fc_os.Getenv(\"{}\")); return string(b) }}()\n",
                FILE_CONTENT_ENV
            );
            let mut out = String::with_capacity(code.len() + import.len() + var.len());
            let mut inserted = false;
            for line in code.split_inclusive('\n') {
                out.push_str(line);
                if !inserted && line.trim_start().starts_with("package ") {
                    if !line.ends_with('\n') {
                        out.push('\n');
                    }
                    out.push_str(import);
                    inserted = true;
                }
            }
            out.push_str(&var);
            out
        }
        // Embedded at compile time; the compile step sees the same env.
        Language::Rust => {
            let preamble = format!(
                "#[allow(dead_code)]\nconst FILE_CONTENT: &str = include_str!(env!(\"{}\"));\n\n",
                FILE_CONTENT_ENV
            );
            insert_at(code, rust_header_end(code), &preamble)
        }
        Language::Php => {
            let preamble = format!("\n$FILE_CONTENT = file_get_contents(getenv(\"{}\"));\n", FILE_CONTENT_ENV);
            match code.find("<?php") {
                Some(at) => {
                    let split = at + "<?php".len();
                    format!("{}{}{}", &code[..split], preamble, &code[split..])
                }
                None => format!("<?php{}?>{}", preamble, code),
            }
        }
        Language::Perl => format!(
            "my $FILE_CONTENT = do {{ local $/; open(my $_fc_fh, \"<\", $ENV{{{}}}) or die \"cannot read file: $!\"; <$_fc_fh> }};\n{}",
            FILE_CONTENT_ENV, code
        ),
        Language::R => format!(
            "FILE_CONTENT <- paste(readLines(Sys.getenv(\"{}\"), warn = FALSE), collapse = \"\\n\")\n{}",
            FILE_CONTENT_ENV, code
        ),
        Language::Elixir => format!(
            "file_content = File.read!(System.get_env(\"{}\"))\n{}",
            FILE_CONTENT_ENV, code
        ),
    }
}

/// Inserts `preamble` at byte offset `at`, on a line of its own.
fn insert_at(code: &str, at: usize, preamble: &str) -> String {
    let (head, tail) = code.split_at(at);
    let mut out = String::with_capacity(code.len() + preamble.len() + 1);
    out.push_str(head);
    if !head.is_empty() && !head.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(preamble);
    out.push_str(tail);
    out
}

/// Length of the first line of `s`, newline included.
fn line_span(s: &str) -> usize {
    s.find('\n').map_or(s.len(), |i| i + 1)
}

/// End of what must stay at the top of a Python module: a docstring and
/// `from __future__` imports, with comments and blank lines in between.
fn python_header_end(code: &str) -> usize {
    let mut pos = 0;
    let mut end = 0;
    let mut docstring_allowed = true;

    while pos < code.len() {
        let rest = &code[pos..];
        let line = rest[..line_span(rest)].trim();

        if line.is_empty() || line.starts_with('#') {
            pos += line_span(rest);
            continue;
        }

        if docstring_allowed {
            if let Some(span) = docstring_span(rest) {
                pos += span;
                end = pos;
                docstring_allowed = false;
                continue;
            }
        }

        if line.starts_with("from __future__ import") {
            pos += match (line.contains('('), rest.find(')')) {
                (true, Some(close)) => close + line_span(&rest[close..]),
                _ => line_span(rest),
            };
            end = pos;
            docstring_allowed = false;
            continue;
        }

        break;
    }

    end
}

/// Span of a string literal statement starting `s`, through the end of
/// its closing line.
fn docstring_span(s: &str) -> Option<usize> {
    let trimmed = s.trim_start();
    let lead = s.len() - trimmed.len();
    let body = trimmed
        .strip_prefix(['r', 'R', 'u', 'U'])
        .unwrap_or(trimmed);
    let prefix = trimmed.len() - body.len();

    ["\"\"\"", "'''", "\"", "'"].iter().find_map(|quote| {
        let after = body.strip_prefix(quote)?;
        let close = after.find(quote)?;
        let stop = lead + prefix + quote.len() + close + quote.len();
        Some(stop + line_span(&s[stop..]))
    })
}

/// End of the leading inner attributes and `//!` docs of a Rust file.
fn rust_header_end(code: &str) -> usize {
    let mut pos = 0;
    let mut end = 0;

    while pos < code.len() {
        let rest = &code[pos..];
        let span = line_span(rest);
        let line = rest[..span].trim();

        if line.starts_with("#![") || line.starts_with("//!") {
            pos += span;
            end = pos;
        } else if line.is_empty() || line.starts_with("//") {
            pos += span;
        } else {
            break;
        }
    }

    end
}
