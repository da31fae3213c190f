use std::io::Write;
use std::process::{Command, Output, Stdio};

use agentbox::RunOutcome;

const ECHO_RUNNER: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/test-codes/echo_runner.wat");
const TRAP: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/test-codes/trap.wat");

fn agentbox(runner: &str, envs: &[(&str, &str)], code: &str) -> Output {
    let dir = tempfile::tempdir().unwrap();
    let mut child = Command::new(env!("CARGO_BIN_EXE_agentbox"))
        // No stray .env from the developer's checkout
        .current_dir(dir.path())
        .env_remove("AGENTBOX_CONFIG")
        .env_remove("AGENTBOX_JSON")
        .env("AGENTBOX_RUNNER", runner)
        .envs(envs.iter().copied())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    child
        .stdin
        .take()
        .unwrap()
        .write_all(code.as_bytes())
        .unwrap();
    child.wait_with_output().unwrap()
}

#[test]
fn test_inherited_output_reaches_host_stdout() {
    let output = agentbox(ECHO_RUNNER, &[], "print('hi')");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Start Execution"), "stdout: {}", stdout);
    assert!(stdout.contains("Executing code: print('hi')"), "stdout: {}", stdout);
    assert!(stdout.contains("End Execution"), "stdout: {}", stdout);
}

#[test]
fn test_json_report_with_captured_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("agentbox.toml");
    std::fs::write(&config, "io_policy = \"captured\"\ntimeout_ms = 5000\n").unwrap();

    let output = agentbox(
        ECHO_RUNNER,
        &[
            ("AGENTBOX_CONFIG", config.to_str().unwrap()),
            ("AGENTBOX_JSON", "1"),
        ],
        "x = 1",
    );
    assert!(output.status.success());

    let outcome: RunOutcome = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(
        outcome.output,
        "Start Execution\nExecuting code: x = 1\nEnd Execution\n"
    );
    assert!(outcome.fuel_consumed.is_none());
}

#[test]
fn test_failed_run_exits_with_status_one() {
    let output = agentbox(TRAP, &[], "");
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
}

#[test]
fn test_missing_runner_variable() {
    let output = Command::new(env!("CARGO_BIN_EXE_agentbox"))
        .env_remove("AGENTBOX_RUNNER")
        .current_dir(tempfile::tempdir().unwrap().path())
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("AGENTBOX_RUNNER"));
}
