//! CLI tests: spawn the storyloop binary and check exit codes.

use std::path::Path;
use std::process::Command;

use storyloop::exit_codes;
use storyloop::io::config::{OrchestratorConfig, write_config};
use storyloop::test_support::{TestRepo, backlog_document, story};

fn write_backlog(dir: &Path, passed: bool) -> std::path::PathBuf {
    let mut stories = vec![story("US-1", 0), story("US-2", 1)];
    for story in &mut stories {
        story.passes = passed;
    }
    let path = dir.join("prd.json");
    let doc = backlog_document("feature/cli", &stories);
    std::fs::write(&path, serde_json::to_string_pretty(&doc).expect("json")).expect("write");
    path
}

fn storyloop(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_storyloop"));
    cmd.current_dir(dir);
    cmd
}

#[test]
fn validate_accepts_backlog() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_backlog(temp.path(), false);
    let output = storyloop(temp.path())
        .arg("validate")
        .arg(&path)
        .output()
        .expect("storyloop validate");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).contains("2 stories"));
}

#[test]
fn select_prints_next_story() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_backlog(temp.path(), false);
    let output = storyloop(temp.path())
        .arg("select")
        .arg(&path)
        .output()
        .expect("storyloop select");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "US-1");
}

#[test]
fn select_complete_backlog_exits_with_nothing_selected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = write_backlog(temp.path(), true);
    let status = storyloop(temp.path())
        .arg("select")
        .arg(&path)
        .status()
        .expect("storyloop select");
    assert_eq!(status.code(), Some(exit_codes::NOTHING_SELECTED));
}

#[test]
fn invalid_backlog_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("prd.json");
    std::fs::write(&path, r#"{"branchName": "x", "userStories": []}"#).expect("write");
    let output = storyloop(temp.path())
        .arg("validate")
        .arg(&path)
        .output()
        .expect("storyloop validate");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("schema validation failed"));
}

#[test]
fn unknown_run_status_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = storyloop(temp.path())
        .args(["status", "no-such-run"])
        .status()
        .expect("storyloop status");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn run_with_fatal_agent_exits_failed_and_streams_events() {
    let repo = TestRepo::with_remote().expect("repo");
    let path = write_backlog(repo.path(), false);
    let mut config = OrchestratorConfig::default();
    config.executor.command = vec![
        "sh".to_string(),
        "-c".to_string(),
        r#"cat >/dev/null; echo '{"type":"failure","reason":"no credential","fatal":true}'"#
            .to_string(),
    ];
    config.executor.workdir = repo.path().to_path_buf();
    config.source_control.workdir = repo.path().to_path_buf();
    write_config(&repo.path().join(".storyloop/config.toml"), &config).expect("config");

    let output = storyloop(repo.path())
        .args(["run", "--project", "cli", "--max-iterations", "3", "--backlog"])
        .arg(&path)
        .output()
        .expect("storyloop run");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        output.status.code(),
        Some(exit_codes::FAILED),
        "stdout: {stdout}\nstderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let kinds: Vec<String> = stdout
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).expect("event json");
            value["type"].as_str().expect("type").to_string()
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "run_status_changed",
            "branch_created",
            "iteration_started",
            "iteration_failed",
            "run_status_changed",
        ]
    );
    assert!(repo.path().join(".storyloop/runs").is_dir());
}
