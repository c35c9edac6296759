//! polyrun - CLI entry point
//!
//! Runs a snippet of code in the chosen language under the host's sandbox
//! and relays its output and exit code.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use polyrun::config::build_sandbox_config;
use polyrun::executor::{
    ExecutionRequest, ExecutionResult, Executor, DEFAULT_HARD_CAP_BYTES, DEFAULT_MAX_OUTPUT_BYTES,
};
use polyrun::runtime::{detect_runtimes, Language};
use polyrun::sandbox::{init_sandbox, SandboxHandle};

/// Exit status reported for a timed-out run, as `timeout(1)` does.
const EXIT_TIMED_OUT: i32 = 124;

/// Exit status reported when the output cap killed the run.
const EXIT_CAPPED: i32 = 137;

/// Run code in a sandbox
///
/// Executes a snippet in any supported language with a timeout, an output
/// cap and filesystem/network confinement.
///
/// # Examples
///
/// Run a shell snippet:
///     polyrun 'echo hello'
///
/// Run Python with a 5 second timeout:
///     polyrun -l python -t 5000 'print(1 + 1)'
///
/// Process a file; its contents are bound to FILE_CONTENT:
///     polyrun -l js -f data.json 'console.log(JSON.parse(FILE_CONTENT).name)'
///
/// Read code from stdin:
///     echo 'puts 42' | polyrun -l ruby
#[derive(Parser, Debug)]
#[command(name = "polyrun")]
#[command(about = "Run code in a sandbox with timeout and output limits")]
#[command(version)]
pub struct Cli {
    /// Code to run; read from stdin when omitted
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    code: Vec<String>,

    /// Language of the code (js, ts, python, shell, ruby, go, rust, php, perl, r, elixir)
    #[arg(long, short = 'l', default_value = "shell")]
    language: Language,

    /// File whose contents are bound to FILE_CONTENT; relative to the project root
    #[arg(long, short = 'f')]
    file: Option<PathBuf>,

    /// Timeout in milliseconds
    #[arg(long, short = 't', default_value_t = 30_000)]
    timeout: u64,

    /// Combined stdout+stderr bytes after which the process tree is killed
    #[arg(long, default_value_t = DEFAULT_HARD_CAP_BYTES)]
    hard_cap: u64,

    /// Per-stream size above which output is shortened to head and tail
    #[arg(long, default_value_t = DEFAULT_MAX_OUTPUT_BYTES)]
    max_output: usize,

    /// Project root: writable inside the sandbox, base for relative --file
    #[arg(long = "project-root", short = 'C')]
    project_root: Option<PathBuf>,

    /// Run without confinement
    #[arg(long)]
    no_sandbox: bool,

    /// Enable debug logging
    ///
    /// Prints generated sandbox profiles, wrapped commands and process
    /// lifecycle events to stderr.
    #[arg(long, short = 'd')]
    debug: bool,

    /// List detected language runtimes and exit
    #[arg(long)]
    runtimes: bool,

    /// Print the resolved sandbox policy as JSON and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_logging(cli.debug)?;

    let code = run(cli).await?;
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let project_root = match &cli.project_root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };
    let project_root = project_root
        .canonicalize()
        .with_context(|| format!("Project root not found: {}", project_root.display()))?;

    if cli.print_config {
        let config = build_sandbox_config(&project_root, None);
        println!("{}", config.to_json_string()?);
        return Ok(0);
    }

    let runtimes = detect_runtimes();
    if cli.runtimes {
        for language in Language::ALL {
            match runtimes.get(language) {
                Some(toolchain) => println!("{:<11} {}", language, toolchain.program().display()),
                None => println!("{:<11} - ({})", language, language.install_hint()),
            }
        }
        return Ok(0);
    }

    let code = if cli.code.is_empty() {
        let mut code = String::new();
        tokio::io::stdin()
            .read_to_string(&mut code)
            .await
            .context("Failed to read code from stdin")?;
        code
    } else {
        cli.code.join(" ")
    };

    let sandbox = if cli.no_sandbox {
        SandboxHandle::passthrough()
    } else {
        init_sandbox(&project_root).await?
    };
    let sandbox = Arc::new(sandbox);

    let request = match cli.file {
        Some(file) => ExecutionRequest::file(cli.language, file, code),
        None => ExecutionRequest::inline(cli.language, code),
    }
    .timeout(Duration::from_millis(cli.timeout))
    .hard_cap_bytes(cli.hard_cap)
    .max_output_bytes(cli.max_output);

    let executor = Executor::new(project_root, runtimes, sandbox.clone());
    let result = executor.execute(&request).await;
    sandbox.cleanup();

    let result = result?;
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);

    Ok(exit_status(&result))
}

fn exit_status(result: &ExecutionResult) -> i32 {
    if result.timed_out {
        EXIT_TIMED_OUT
    } else if result.capped {
        EXIT_CAPPED
    } else {
        result.exit_code
    }
}

/// Initializes the logging system.
///
/// `--debug` raises the level to DEBUG; otherwise only warnings are shown
/// so that log lines do not mix with the program's own stderr.
/// `RUST_LOG` overrides both.
fn initialize_logging(debug: bool) -> Result<()> {
    let log_level = if debug { "debug" } else { "warn" };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    Ok(())
}
