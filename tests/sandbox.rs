//! Confinement behaviour. Every test skips when the host has no working
//! sandbox mechanism (no `bwrap`, user namespaces disabled, not macOS).

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use polyrun::config::{resolve_sandbox_config, EnvOverrides};
use polyrun::executor::Executor;
use polyrun::runtime::{detect_runtimes, Language};
use polyrun::sandbox::SandboxHandle;
use tempfile::TempDir;

struct Fixture {
    project: TempDir,
    _home: TempDir,
    executor: Executor,
}

/// Builds a sandboxed executor. `prepare` runs first, because Bubblewrap
/// resolves protected paths when the handle is created.
async fn sandboxed_with(prepare: impl FnOnce(&Path, &Path)) -> Option<Fixture> {
    let project = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    prepare(project.path(), home.path());
    let project_root = project.path().canonicalize().unwrap();

    let env = EnvOverrides {
        no_sandbox: false,
        allowed_domains: Some(vec!["github.com".to_string()]),
    };
    let config = resolve_sandbox_config(&project_root, Some(home.path()), &env);
    let handle = SandboxHandle::from_config(config).await.unwrap();
    if !handle.sandboxed() {
        eprintln!("skipping: no sandbox mechanism on this host");
        return None;
    }

    let executor = Executor::new(project_root, detect_runtimes(), Arc::new(handle));
    Some(Fixture {
        project,
        _home: home,
        executor,
    })
}

async fn sandboxed() -> Option<Fixture> {
    sandboxed_with(|_, _| {}).await
}

async fn sh(executor: &Executor, code: &str) -> polyrun::ExecutionResult {
    executor
        .run(Language::Shell, code, Some(Duration::from_secs(20)), None, None)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_write_inside_project_succeeds() {
    let Some(fx) = sandboxed().await else { return };

    let result = sh(&fx.executor, "echo hi > inside.txt && cat inside.txt").await;
    assert_eq!(result.exit_code, 0, "{:?}", result);
    assert_eq!(
        std::fs::read_to_string(fx.project.path().join("inside.txt")).unwrap(),
        "hi\n"
    );
}

#[tokio::test]
async fn test_write_outside_allowed_roots_never_lands() {
    let Some(fx) = sandboxed().await else { return };
    let Some(real_home) = dirs::home_dir() else { return };
    if real_home.starts_with(std::env::temp_dir()) {
        eprintln!("skipping: home directory is inside the temp directory");
        return;
    }

    let target = real_home.join(format!("polyrun-escape-{}.txt", std::process::id()));
    let code = format!("echo escaped > {}", polyrun::utils::shell::quote(&target.to_string_lossy()));
    let result = sh(&fx.executor, &code).await;

    let landed = target.exists();
    if landed {
        let _ = std::fs::remove_file(&target);
    }
    assert!(!landed, "write escaped the sandbox: {:?}", result);
    assert_ne!(result.exit_code, 0);
}

#[tokio::test]
async fn test_protected_file_in_project_not_writable() {
    let Some(fx) = sandboxed_with(|project, _| {
        std::fs::write(project.join(".env"), "SECRET=1\n").unwrap();
    })
    .await
    else {
        return;
    };

    let _ = sh(&fx.executor, "echo SECRET=2 > .env").await;
    assert_eq!(
        std::fs::read_to_string(fx.project.path().join(".env")).unwrap(),
        "SECRET=1\n"
    );
}

#[tokio::test]
async fn test_protected_file_cannot_be_created() {
    let Some(fx) = sandboxed().await else { return };
    let env_file = fx.project.path().join(".env");

    let _ = sh(&fx.executor, "echo SECRET=2 > .env").await;
    let written = std::fs::read_to_string(&env_file).unwrap_or_default();
    assert!(!written.contains("SECRET=2"));

    // Nothing is left in the project once the handle is cleaned up.
    fx.executor.sandbox().cleanup();
    assert!(!env_file.exists());
}

#[tokio::test]
async fn test_credentials_unreadable() {
    let key = std::sync::Arc::new(std::sync::Mutex::new(None));
    let key_slot = key.clone();
    let Some(fx) = sandboxed_with(move |_, home| {
        std::fs::create_dir(home.join(".ssh")).unwrap();
        let path = home.join(".ssh/id_ed25519");
        std::fs::write(&path, "PRIVATE-KEY-MATERIAL").unwrap();
        *key_slot.lock().unwrap() = Some(path);
    })
    .await
    else {
        return;
    };

    let path = key.lock().unwrap().clone().unwrap();
    let code = format!("cat {}", polyrun::utils::shell::quote(&path.to_string_lossy()));
    let result = sh(&fx.executor, &code).await;
    assert!(!result.stdout.contains("PRIVATE-KEY-MATERIAL"), "{:?}", result);
}

#[tokio::test]
async fn test_blocked_domain_never_succeeds() {
    let Some(fx) = sandboxed().await else { return };
    if which::which("curl").is_err() {
        eprintln!("skipping: curl not installed");
        return;
    }

    let result = sh(&fx.executor, "curl -s -m 5 http://example.com/").await;
    assert!(!result.stdout.contains("Example Domain"), "{:?}", result);
}

#[tokio::test]
async fn test_concurrent_sandboxed_sessions() {
    let Some(fx) = sandboxed().await else { return };
    let executor = Arc::new(fx.executor);

    let tasks: Vec<_> = (0..5)
        .map(|i| {
            let executor = executor.clone();
            tokio::spawn(async move {
                let code = format!("echo session-{i} > out-{i}.txt && cat out-{i}.txt");
                (i, sh(&executor, &code).await)
            })
        })
        .collect();

    for task in tasks {
        let (i, result) = task.await.unwrap();
        assert_eq!(result.stdout, format!("session-{i}\n"));
    }
    assert!(fx.project.path().join("out-4.txt").exists());
}
