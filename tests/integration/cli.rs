#[path = "common/mod.rs"]
mod common;

use std::{process::Stdio, thread, time::Duration};

use assert_cmd::Command;
use common::{unused_port, wait_for_path, write_config};
use predicates::prelude::*;
use tempfile::tempdir;

fn tether() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("tether"))
}

#[test]
fn check_prints_start_order() {
    let dir = tempdir().unwrap();
    let port = unused_port();
    let config = write_config(
        dir.path(),
        &format!(
            r#"
version: "1"
processes:
  - name: tunnel
    command: ngrok
    args: ["http", "{{{{server.url}}}}"]
    order: 2
  - name: server
    command: uvicorn
    order: 1
    readiness:
      type: tcp
      port: {port}
"#
        ),
    );

    tether()
        .args(["check", "--config", config.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("1. server"))
        .stdout(predicate::str::contains("2. tunnel"))
        .stdout(predicate::str::contains(format!("http://127.0.0.1:{port}")));
}

#[test]
fn check_rejects_invalid_config_with_code_4() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"
version: "1"
processes:
  - name: tunnel
    command: ngrok
    args: ["{{server.url}}"]
"#,
    );

    tether()
        .args(["check", "--config", config.to_str().unwrap()])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("unknown process"));
}

#[test]
fn start_with_missing_config_exits_with_code_4() {
    let dir = tempdir().unwrap();
    tether()
        .current_dir(dir.path())
        .arg("start")
        .assert()
        .code(4);
}

#[test]
fn start_with_missing_binary_exits_with_code_1() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"
version: "1"
settings:
  poll_interval: 25ms
processes:
  - name: server
    command: /definitely/not/installed/uvicorn
"#,
    );

    tether()
        .args(["start", "--config", config.to_str().unwrap()])
        .assert()
        .code(1);
}

#[test]
fn start_exits_with_code_3_when_process_dies() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"
version: "1"
settings:
  poll_interval: 25ms
processes:
  - name: server
    command: sh
    args: ["-c", "sleep 0.2; exit 5"]
"#,
    );

    tether()
        .args(["start", "--config", config.to_str().unwrap()])
        .timeout(Duration::from_secs(20))
        .assert()
        .code(3);
}

#[test]
fn sigterm_shuts_down_cleanly_and_status_reads_snapshot() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"
version: "1"
settings:
  poll_interval: 25ms
  grace_period: 2s
  state_file: state.json
processes:
  - name: server
    command: sleep
    args: ["30"]
"#,
    );

    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin!("tether"))
        .args(["start", "--config", config.to_str().unwrap()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let state = dir.path().join("state.json");
    wait_for_path(&state);
    thread::sleep(Duration::from_millis(300));

    tether()
        .args(["status", "--state", state.to_str().unwrap(), "--no-color"])
        .assert()
        .success()
        .stdout(predicate::str::contains("server"))
        .stdout(predicate::str::contains("ready"));

    unsafe {
        libc::kill(child.id() as i32, libc::SIGTERM);
    }
    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(0));

    tether()
        .args(["status", "--config", config.to_str().unwrap(), "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"stopped\""));
}

#[test]
fn status_without_snapshot_fails() {
    let dir = tempdir().unwrap();
    tether()
        .args([
            "status",
            "--state",
            dir.path().join("missing.json").to_str().unwrap(),
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("No state file"));
}
