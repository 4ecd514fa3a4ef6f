use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    thread,
};

use nodeflow_core::logging::{crash_dir, install_crash_hook, CrashHook, REDACTION_PLACEHOLDER};
use tempfile::tempdir;

const CHILD_MODE_ENV: &str = "NODEFLOW_PANIC_CHILD_MODE";
const CHILD_DATA_DIR_ENV: &str = "NODEFLOW_PANIC_CHILD_DATA_DIR";

fn run_panic_child(mode: &str, data_dir: &Path) -> std::process::Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .arg("panic_hook_child_entrypoint")
        .arg("--exact")
        .arg("--nocapture")
        .env(CHILD_MODE_ENV, mode)
        .env(CHILD_DATA_DIR_ENV, data_dir)
        .output()
        .expect("run panic hook child")
}

fn crash_artifacts(data_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(crash_dir(data_dir)) else {
        return Vec::new();
    };
    let mut paths = entries
        .map(|entry| entry.expect("read crash directory entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

/// Runs only when re-invoked by the tests below with the child env set.
#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var(CHILD_MODE_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(
        std::env::var(CHILD_DATA_DIR_ENV).expect("child data dir must be set"),
    );

    let expected_dir = crash_dir(&data_dir);
    assert_eq!(install_crash_hook(&data_dir), CrashHook::Installed(expected_dir.clone()));
    assert_eq!(install_crash_hook(&data_dir), CrashHook::AlreadyInstalled(expected_dir));

    match mode.as_str() {
        "worker_panic" => {
            // A panic on a named worker thread is recorded, then the main thread
            // fails on the join result.
            let worker = thread::Builder::new()
                .name("nodeflow-worker-crashy".to_string())
                .spawn(|| panic!("worker exploded with token=abc123"))
                .expect("spawn worker thread");
            if worker.join().is_err() {
                panic!("worker thread panicked");
            }
        }
        other => panic!("unknown panic hook child mode: {other}"),
    }
}

#[test]
fn crash_hook_writes_redacted_artifact_for_worker_panic() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("worker_panic", data_dir.path());
    assert!(!output.status.success(), "child process should fail");

    let artifacts = crash_artifacts(data_dir.path());
    assert!(
        !artifacts.is_empty(),
        "expected at least one crash artifact, stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let worker_report = artifacts
        .iter()
        .map(|path| fs::read_to_string(path).expect("read crash artifact"))
        .find(|content| content.contains("thread=nodeflow-worker-crashy"))
        .expect("artifact for the worker thread");

    assert!(worker_report.contains("payload=worker exploded with"));
    assert!(worker_report.contains(&format!("token={REDACTION_PLACEHOLDER}")));
    assert!(!worker_report.contains("abc123"));
    assert!(worker_report.contains("backtrace:"));
}
