//! End-to-end tests for the gpipe binary
//!
//! These run the real executable against real pipeline definitions:
//! plan rendering, plugin inspection, mode semantics, parameter overrides,
//! resume, and PROCESS dispatch (which re-invokes this same binary).

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let file = dir.join(name);
    std::fs::write(&file, contents).unwrap();
    file
}

/// Fresh command with a deterministic environment
fn gpipe() -> Command {
    let mut cmd = Command::cargo_bin("gpipe").unwrap();
    cmd.env_remove("DATABASE_URL")
        .env_remove("LOG_OUTPUT")
        .env_remove("LOG_FILE")
        .env("LOG_LEVEL", "info");
    cmd
}

// ============================================================================
// Plugin Inspection
// ============================================================================

#[test]
fn test_list_plugins_prints_builtins() {
    gpipe()
        .arg("--list-plugins")
        .assert()
        .success()
        .stdout(predicate::str::contains("jsonl-loader"));
}

#[test]
fn test_describe_plugin_shows_parameters() {
    gpipe()
        .arg("--describe-plugin")
        .arg("jsonl-loader")
        .assert()
        .success()
        .stdout(predicate::str::contains("jsonl-loader"))
        .stdout(predicate::str::contains("batch_size"))
        .stdout(predicate::str::contains("Affected tables"));
}

#[test]
fn test_describe_unknown_plugin_fails() {
    gpipe()
        .arg("--describe-plugin")
        .arg("no-such-plugin")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no-such-plugin"));
}

// ============================================================================
// Argument Validation
// ============================================================================

#[test]
fn test_config_is_required_for_a_run() {
    gpipe()
        .arg("--mode")
        .arg("COMMIT")
        .assert()
        .failure()
        .stderr(predicate::str::contains("pipeline definition"));
}

#[test]
fn test_malformed_param_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_file(
        dir.path(),
        "pipeline.yaml",
        r#"
stages:
  - name: Announce
    tasks:
      - name: Hello
        type: NOTIFY
        message: hi
"#,
    );

    gpipe()
        .arg(&config)
        .arg("--param")
        .arg("bogus")
        .assert()
        .failure()
        .stderr(predicate::str::contains("KEY=VALUE"));
}

// ============================================================================
// Plan Rendering
// ============================================================================

#[test]
fn test_plan_only_renders_decision_table() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_file(
        dir.path(),
        "pipeline.yaml",
        r#"
params:
  data_dir: /tmp/etl
stages:
  - name: Extract
    tasks:
      - name: Fetch
        type: SHELL
        command: "echo fetch"
        params:
          marker: "${data_dir}/done"
  - name: Wrap
    tasks:
      - name: Done
        type: NOTIFY
        message: done
"#,
    );

    gpipe()
        .arg(&config)
        .arg("--plan-only")
        .arg("--skip")
        .arg("Wrap")
        .assert()
        .success()
        .stdout(predicate::str::contains("stage Extract"))
        .stdout(predicate::str::contains("[run]"))
        .stdout(predicate::str::contains(r#"params {"marker":"/tmp/etl/done"}"#))
        .stdout(predicate::str::contains("[skip: --skip]"))
        .stdout(predicate::str::contains("1 task(s) will run"));
}

// ============================================================================
// Execution Modes
// ============================================================================

#[test]
fn test_dry_run_simulates_shell_commands() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    let config = write_file(
        dir.path(),
        "pipeline.yaml",
        &format!(
            r#"
stages:
  - name: Build
    tasks:
      - name: Touch
        type: SHELL
        command: "touch {}"
"#,
            marker.display()
        ),
    );

    gpipe()
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("DRY RUN: would execute"))
        .stdout(predicate::str::contains("COMPLETED"));
    assert!(!marker.exists(), "dry run must not touch the file system");
}

#[test]
fn test_commit_mode_runs_shell_commands() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    let config = write_file(
        dir.path(),
        "pipeline.yaml",
        &format!(
            r#"
stages:
  - name: Build
    tasks:
      - name: Touch
        type: SHELL
        command: "touch {}"
"#,
            marker.display()
        ),
    );

    gpipe().arg(&config).arg("--mode").arg("COMMIT").assert().success();
    assert!(marker.exists());
}

#[test]
fn test_failing_shell_command_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_file(
        dir.path(),
        "pipeline.yaml",
        r#"
stages:
  - name: Build
    tasks:
      - name: Boom
        type: SHELL
        command: "exit 3"
"#,
    );

    gpipe()
        .arg(&config)
        .arg("--mode")
        .arg("COMMIT")
        .assert()
        .failure()
        .stdout(predicate::str::contains("FAILED"));
}

// ============================================================================
// Parameters and Resume
// ============================================================================

#[test]
fn test_param_override_reaches_notify() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_file(
        dir.path(),
        "pipeline.yaml",
        r#"
params:
  greeting: default
stages:
  - name: Announce
    tasks:
      - name: Hello
        type: NOTIFY
        message: "${greeting}"
"#,
    );

    gpipe()
        .arg(&config)
        .arg("--param")
        .arg("greeting=hello from the cli")
        .assert()
        .success()
        .stdout(predicate::str::contains("NOTIFY: hello from the cli"));
}

#[test]
fn test_missing_interpolation_key_fails_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_file(
        dir.path(),
        "pipeline.yaml",
        r#"
stages:
  - name: Announce
    tasks:
      - name: Hello
        type: NOTIFY
        message: "${absent}"
"#,
    );

    gpipe()
        .arg(&config)
        .assert()
        .failure()
        .stdout(predicate::str::contains("${absent}"));
}

#[test]
fn test_resume_at_skips_earlier_stages() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_file(
        dir.path(),
        "pipeline.yaml",
        r#"
stages:
  - name: Start
    tasks:
      - name: Announce
        type: NOTIFY
        message: from start
  - name: Wrap
    tasks:
      - name: Announce
        type: NOTIFY
        message: from wrap
"#,
    );

    gpipe()
        .arg(&config)
        .arg("--resume-at")
        .arg("Wrap")
        .assert()
        .success()
        .stdout(predicate::str::contains("NOTIFY: from wrap"))
        .stdout(predicate::str::contains("NOTIFY: from start").not());
}

// ============================================================================
// Webhook Notification
// ============================================================================

#[tokio::test]
async fn test_webhook_notification_posts() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/etl"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = write_file(
        dir.path(),
        "pipeline.yaml",
        r#"
stages:
  - name: Announce
    tasks:
      - name: Hook
        type: NOTIFY
        channel: webhook
        message: run finished
        params:
          url: "${hook}"
"#,
    );

    let url = format!("{}/hooks/etl", mock_server.uri());
    let assert = tokio::task::spawn_blocking(move || {
        gpipe()
            .arg(&config)
            .arg("--mode")
            .arg("COMMIT")
            .arg("--param")
            .arg(format!("hook={url}"))
            .assert()
            .success()
    });
    assert.await.unwrap();
}

// ============================================================================
// PROCESS Dispatch
// ============================================================================

#[test]
fn test_process_stage_spawns_workers() {
    let dir = tempfile::tempdir().unwrap();
    let left = dir.path().join("left");
    let right = dir.path().join("right");
    let config = write_file(
        dir.path(),
        "pipeline.yaml",
        &format!(
            r#"
stages:
  - name: Build
    parallel_mode: PROCESS
    max_concurrency: 2
    tasks:
      - name: Left
        type: SHELL
        command: "touch {}"
      - name: Right
        type: SHELL
        command: "touch {}"
"#,
            left.display(),
            right.display()
        ),
    );

    gpipe()
        .arg(&config)
        .arg("--mode")
        .arg("COMMIT")
        .assert()
        .success()
        .stdout(predicate::str::contains("COMPLETED"));
    assert!(left.exists());
    assert!(right.exists());
}
