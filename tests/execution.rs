//! End-to-end execution tests without confinement.
//!
//! Languages whose toolchain is not installed are skipped.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use polyrun::error::ExecError;
use polyrun::executor::{cap_diagnostic, ExecutionRequest, Executor};
use polyrun::runtime::{detect_runtimes, Language};
use polyrun::sandbox::SandboxHandle;
use tempfile::TempDir;

fn executor(root: &Path) -> Executor {
    Executor::new(root, detect_runtimes(), Arc::new(SandboxHandle::passthrough()))
}

fn print_ok(language: Language) -> &'static str {
    match language {
        Language::JavaScript => "console.log('ok')",
        Language::TypeScript => "const word: string = 'ok';\nconsole.log(word);",
        Language::Python => "print('ok')",
        Language::Shell => "echo ok",
        Language::Ruby => "puts 'ok'",
        Language::Go => "fmt.Println(\"ok\")",
        Language::Rust => "println!(\"ok\");",
        Language::Php => "echo \"ok\\n\";",
        Language::Perl => "print \"ok\\n\";",
        Language::R => "cat('ok\\n')",
        Language::Elixir => "IO.puts(\"ok\")",
    }
}

fn throw_boom(language: Language) -> &'static str {
    match language {
        Language::JavaScript | Language::TypeScript => "throw new Error('boom');",
        Language::Python => "raise RuntimeError('boom')",
        Language::Shell => "echo boom >&2\nexit 1",
        Language::Ruby => "raise 'boom'",
        Language::Go => "panic(\"boom\")",
        Language::Rust => "panic!(\"boom\");",
        Language::Php => "throw new Exception('boom');",
        Language::Perl => "die \"boom\\n\";",
        Language::R => "stop('boom')",
        Language::Elixir => "raise \"boom\"",
    }
}

/// True while `pid` exists and is not a zombie.
fn alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if kill(Pid::from_raw(pid), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !stat
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => !cfg!(target_os = "linux"),
    }
}

async fn assert_all_dead(pids: &[i32]) {
    for _ in 0..50 {
        if pids.iter().all(|&pid| !alive(pid)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("processes still alive: {:?}", pids);
}

fn read_pids(path: &Path) -> Vec<i32> {
    std::fs::read_to_string(path)
        .unwrap()
        .split_whitespace()
        .map(|p| p.parse().unwrap())
        .collect()
}

#[tokio::test]
async fn test_every_language_prints_ok() {
    let root = TempDir::new().unwrap();
    let executor = executor(root.path());

    for language in Language::ALL {
        if !executor.runtimes().is_available(language) {
            eprintln!("skipping {}: toolchain not installed", language);
            continue;
        }
        let result = executor
            .run(language, print_ok(language), Some(Duration::from_secs(120)), None, None)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0, "{}: {:?}", language, result);
        assert!(result.stdout.contains("ok"), "{}: {:?}", language, result);
        assert!(result.succeeded());
    }
}

#[tokio::test]
async fn test_every_language_reports_errors() {
    let root = TempDir::new().unwrap();
    let executor = executor(root.path());

    for language in Language::ALL {
        if !executor.runtimes().is_available(language) {
            eprintln!("skipping {}: toolchain not installed", language);
            continue;
        }
        let result = executor
            .run(language, throw_boom(language), Some(Duration::from_secs(120)), None, None)
            .await
            .unwrap();
        assert_ne!(result.exit_code, 0, "{}: {:?}", language, result);
        assert!(!result.succeeded());
        // PHP's CLI may print uncaught exceptions to stdout.
        let combined = format!("{}{}", result.stdout, result.stderr);
        assert!(combined.contains("boom"), "{}: {:?}", language, result);
    }
}

#[tokio::test]
async fn test_shell_error_goes_to_stderr() {
    let root = TempDir::new().unwrap();
    let result = executor(root.path())
        .run(Language::Shell, "echo out; echo boom >&2; exit 7", None, None, None)
        .await
        .unwrap();
    assert_eq!(result.exit_code, 7);
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "boom\n");
}

#[tokio::test]
async fn test_shell_timeout_kills_everything() {
    let root = TempDir::new().unwrap();
    let started = Instant::now();
    let result = executor(root.path())
        .run(
            Language::Shell,
            "echo $$ > pids.txt\nsleep 60 &\necho $! >> pids.txt\nsleep 60",
            Some(Duration::from_millis(500)),
            None,
            None,
        )
        .await
        .unwrap();

    assert!(result.timed_out);
    assert!(!result.capped);
    assert!(!result.succeeded());
    assert!(!result.stderr.contains("output capped"));
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());

    assert_all_dead(&read_pids(&root.path().join("pids.txt"))).await;
}

#[tokio::test]
async fn test_javascript_infinite_loop_times_out() {
    let root = TempDir::new().unwrap();
    let started = Instant::now();
    let result = executor(root.path())
        .run(
            Language::JavaScript,
            "while (true) {}",
            Some(Duration::from_millis(500)),
            None,
            None,
        )
        .await;

    // node may be missing entirely; that is a setup error, not a hang.
    match result {
        Ok(result) => {
            assert!(result.timed_out);
            assert!(started.elapsed() < Duration::from_secs(3));
        }
        Err(ExecError::Spawn { .. }) => eprintln!("skipping: no JavaScript runtime"),
        Err(e) => panic!("unexpected error: {}", e),
    }
}

#[tokio::test]
async fn test_hard_cap_kills_process_tree() {
    let root = TempDir::new().unwrap();
    let started = Instant::now();
    let result = executor(root.path())
        .run(
            Language::Shell,
            "echo $$ > pids.txt\nsleep 60 &\necho $! >> pids.txt\n\
             i=0; while [ $i -lt 2000 ]; do echo 'xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx'; i=$((i+1)); done\nwait",
            Some(Duration::from_secs(20)),
            Some(1024),
            None,
        )
        .await
        .unwrap();

    assert!(result.capped);
    assert!(!result.timed_out);
    assert!(!result.succeeded());

    let diagnostic = cap_diagnostic(1024);
    assert!(result.stderr.ends_with(&diagnostic));
    assert!(diagnostic.contains("1024 bytes"));
    assert!(diagnostic.contains("killed"));

    assert_program_bytes_at_cap(&result, 1024);
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_all_dead(&read_pids(&root.path().join("pids.txt"))).await;
}

/// A capped run keeps exactly `cap` bytes of program output. The
/// diagnostic may start with a separating newline of its own.
fn assert_program_bytes_at_cap(result: &polyrun::ExecutionResult, cap: u64) {
    let body = result
        .stderr
        .strip_suffix(cap_diagnostic(cap).as_str())
        .expect("stderr ends with the cap diagnostic");
    let collected = (result.stdout.len() + body.len()) as u64;
    assert!(
        collected == cap || (collected == cap + 1 && body.ends_with('\n')),
        "collected {} bytes",
        collected
    );
}

#[tokio::test]
async fn test_hard_cap_counts_both_streams() {
    let root = TempDir::new().unwrap();
    let result = executor(root.path())
        .run(
            Language::Shell,
            "head -c 600 /dev/zero | tr '\\0' e >&2; sleep 0.2; while :; do printf 'out-line\\n'; done",
            Some(Duration::from_secs(20)),
            Some(1024),
            None,
        )
        .await
        .unwrap();

    assert!(result.capped);
    assert!(result.stderr.starts_with(&"e".repeat(600)));
    assert!(result.stdout.starts_with("out-line\n"));
    assert_eq!(result.stdout.len(), 1024 - 600);
    assert_program_bytes_at_cap(&result, 1024);
}

#[tokio::test]
async fn test_long_output_truncated() {
    let root = TempDir::new().unwrap();
    let result = executor(root.path())
        .run(
            Language::Shell,
            "i=1; while [ $i -le 100 ]; do echo \"line $i\"; i=$((i+1)); done",
            None,
            None,
            Some(200),
        )
        .await
        .unwrap();

    assert_eq!(result.exit_code, 0);
    assert!(!result.capped);
    assert!(result.stdout.starts_with("line 1\n"));
    assert!(result.stdout.ends_with("line 100\n"));
    assert!(result.stdout.contains("lines /"));
    assert!(result.stdout.contains("bytes omitted; showing first"));
    assert!(result.stdout.lines().all(|l| l.is_empty() || l.starts_with("line ") || l.starts_with("... [")));
}

#[tokio::test]
async fn test_short_output_unchanged() {
    let root = TempDir::new().unwrap();
    let result = executor(root.path())
        .run(Language::Shell, "printf 'a\\nb\\n'", None, None, Some(200))
        .await
        .unwrap();
    assert_eq!(result.stdout, "a\nb\n");
}

#[tokio::test]
async fn test_file_mode_relative_path() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir(root.path().join("data")).unwrap();
    std::fs::write(root.path().join("data/input.txt"), "hello file").unwrap();

    let result = executor(root.path())
        .run_file(Language::Shell, "data/input.txt", "printf '%s' \"$FILE_CONTENT\"", None, None, None)
        .await
        .unwrap();
    assert_eq!(result.stdout, "hello file");
}

#[tokio::test]
async fn test_file_mode_absolute_path_bypasses_root() {
    let root = TempDir::new().unwrap();
    let elsewhere = TempDir::new().unwrap();
    let target = elsewhere.path().join("outside.txt");
    std::fs::write(&target, "from elsewhere").unwrap();

    let result = executor(root.path())
        .run_file(Language::Shell, &target, "printf '%s' \"$FILE_CONTENT\"", None, None, None)
        .await
        .unwrap();
    assert_eq!(result.stdout, "from elsewhere");
}

#[tokio::test]
async fn test_file_mode_missing_path_fails_before_spawn() {
    let root = TempDir::new().unwrap();
    let err = executor(root.path())
        .run_file(
            Language::Shell,
            "missing.txt",
            "touch spawned.txt",
            None,
            None,
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ExecError::SourceUnreadable { .. }));
    assert!(err.is_setup_error());
    assert!(!root.path().join("spawned.txt").exists());
}

#[tokio::test]
async fn test_file_mode_hostile_path_is_literal() {
    let root = TempDir::new().unwrap();
    let name = "it's a \"$HOME\" `touch pwned` $(touch pwned2).txt";
    std::fs::write(root.path().join(name), "safe").unwrap();

    let result = executor(root.path())
        .run_file(Language::Shell, name, "printf '%s' \"$FILE_CONTENT\"", None, None, None)
        .await
        .unwrap();
    assert_eq!(result.stdout, "safe");
    assert!(!root.path().join("pwned").exists());
    assert!(!root.path().join("pwned2").exists());
}

#[tokio::test]
async fn test_file_mode_python() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("n.txt"), "12345").unwrap();
    let executor = executor(root.path());
    if !executor.runtimes().is_available(Language::Python) {
        eprintln!("skipping: python not installed");
        return;
    }

    let result = executor
        .run_file(Language::Python, "n.txt", "print(len(FILE_CONTENT))", None, None, None)
        .await
        .unwrap();
    assert_eq!(result.stdout.trim(), "5");
}

#[tokio::test]
async fn test_file_mode_python_future_import() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("in.txt"), "from the file").unwrap();
    let executor = executor(root.path());
    if !executor.runtimes().is_available(Language::Python) {
        eprintln!("skipping: python not installed");
        return;
    }

    let code = "\"\"\"Echo the input.\"\"\"\nfrom __future__ import annotations\nprint(FILE_CONTENT)\n";
    let result = executor
        .run_file(Language::Python, "in.txt", code, None, None, None)
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0, "{:?}", result);
    assert_eq!(result.stdout, "from the file\n");
}

#[tokio::test]
async fn test_file_mode_rust() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("in.txt"), "from the file").unwrap();
    let executor = executor(root.path());
    if !executor.runtimes().is_available(Language::Rust) {
        eprintln!("skipping: rustc not installed");
        return;
    }

    let result = executor
        .run_file(
            Language::Rust,
            "in.txt",
            "println!(\"{}\", FILE_CONTENT);",
            Some(Duration::from_secs(120)),
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0, "{:?}", result);
    assert_eq!(result.stdout, "from the file\n");
}

#[tokio::test]
async fn test_concurrent_executions_do_not_interleave() {
    let root = TempDir::new().unwrap();
    let executor = Arc::new(executor(root.path()));

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let executor = executor.clone();
            tokio::spawn(async move {
                let code = format!("echo start-{i}; sleep 0.2; echo end-{i}; echo err-{i} >&2");
                (i, executor.run(Language::Shell, &code, None, None, None).await)
            })
        })
        .collect();

    for task in tasks {
        let (i, result) = task.await.unwrap();
        let result = result.unwrap();
        assert_eq!(result.stdout, format!("start-{i}\nend-{i}\n"));
        assert_eq!(result.stderr, format!("err-{i}\n"));
    }
}

#[tokio::test]
async fn test_execute_built_request() {
    let root = TempDir::new().unwrap();
    let request = ExecutionRequest::inline(Language::Shell, "echo built")
        .timeout(Duration::from_secs(5))
        .max_output_bytes(1000);
    let result = executor(root.path()).execute(&request).await.unwrap();
    assert_eq!(result.stdout, "built\n");
}

#[tokio::test]
async fn test_shell_runs_in_project_root() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("marker"), "").unwrap();
    let result = executor(root.path())
        .run(Language::Shell, "ls", None, None, None)
        .await
        .unwrap();
    assert!(result.stdout.contains("marker"));
}
