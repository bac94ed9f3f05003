#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    net::TcpListener,
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use common::{
    fast_settings, run_in_background, shell_process, unused_port, wait_for_lines,
    wait_for_path, write_config,
};
use tempfile::tempdir;
use tether::{
    backoff::Backoff,
    config::load_config,
    error::SupervisorError,
    process::ProcessState,
    readiness::ReadinessCheck,
    status::StateSnapshot,
    supervisor::Supervisor,
};

#[test]
fn tunnel_starts_only_after_server_port_opens() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("tunnel-started");
    let port = unused_port();

    let mut server = shell_process("server", "sleep 30");
    server.readiness = ReadinessCheck::TcpConnect {
        host: "127.0.0.1".into(),
        port,
    };
    server.retry.max_wait = Duration::from_secs(10);
    server.retry.backoff = Backoff::new(Duration::from_millis(50), Duration::from_millis(200));
    let tunnel = shell_process("tunnel", &format!("touch {}; sleep 30", marker.display()));

    let supervisor = Supervisor::from_parts(vec![server, tunnel], fast_settings());
    let token = supervisor.shutdown_token();
    let runner = run_in_background(supervisor);

    // The "server" opens its port after a delay, well beyond the first probe.
    let (bound_tx, bound_rx) = mpsc::channel();
    let opener = thread::spawn(move || {
        thread::sleep(Duration::from_millis(1500));
        let opened_at = Instant::now();
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        bound_tx.send(opened_at).unwrap();
        thread::sleep(Duration::from_secs(3));
        drop(listener);
    });

    wait_for_path(&marker);
    let bound_at = bound_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    token.request();

    let (supervisor, result) = runner.join().unwrap();
    result.unwrap();
    opener.join().unwrap();

    let server = supervisor.handle("server").unwrap();
    let tunnel = supervisor.handle("tunnel").unwrap();
    let server_ready = server.first_entered(ProcessState::Ready).unwrap();
    let tunnel_starting = tunnel.first_entered(ProcessState::Starting).unwrap();

    assert!(server_ready >= bound_at);
    assert!(tunnel_starting >= server_ready);
    assert_eq!(server.state(), ProcessState::Stopped);
    assert_eq!(tunnel.state(), ProcessState::Stopped);
}

#[test]
fn readiness_timeout_fails_startup_with_code_2() {
    let dir = tempdir().unwrap();
    let port = unused_port();
    let config = write_config(
        dir.path(),
        &format!(
            r#"
version: "1"
settings:
  poll_interval: 25ms
  grace_period: 2s
processes:
  - name: server
    command: sleep
    args: ["30"]
    readiness:
      type: tcp
      port: {port}
      timeout: 100ms
      max_wait: 500ms
      backoff: 50ms
  - name: tunnel
    command: sleep
    args: ["30"]
"#
        ),
    );

    let config = load_config(config.to_str()).unwrap();
    let mut supervisor = Supervisor::new(&config).unwrap();
    let started = Instant::now();
    let err = supervisor.run().unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(
        matches!(err, SupervisorError::ReadinessTimeout { ref process, .. } if process == "server")
    );
    assert_eq!(err.exit_code(), 2);

    let server = supervisor.handle("server").unwrap();
    assert_eq!(server.state(), ProcessState::Failed);
    assert!(!server.is_alive());
    assert_eq!(supervisor.handle("tunnel").unwrap().state(), ProcessState::Pending);
}

#[test]
fn missing_executable_fails_with_code_1() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"
version: "1"
settings:
  poll_interval: 25ms
processes:
  - name: server
    command: ./.venv/bin/uvicorn
    args: ["app:app"]
  - name: tunnel
    command: sleep
    args: ["30"]
"#,
    );

    let config = load_config(config.to_str()).unwrap();
    let mut supervisor = Supervisor::new(&config).unwrap();
    let err = supervisor.run().unwrap_err();

    assert_eq!(err.exit_code(), 1);
    assert_eq!(err.process(), Some("server"));
    assert_eq!(supervisor.handle("tunnel").unwrap().state(), ProcessState::Pending);
}

#[test]
fn endpoints_flow_into_later_processes_and_output_is_captured() {
    let dir = tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = write_config(
        dir.path(),
        &format!(
            r#"
version: "1"
settings:
  poll_interval: 25ms
  grace_period: 2s
  log_dir: logs
  state_file: run/state.json
processes:
  - name: server
    command: sleep
    args: ["30"]
    readiness:
      type: tcp
      port: {port}
  - name: tunnel
    command: sh
    args: ["-c", "echo forwarding to $TARGET; echo {{{{server.port}}}} >&2; sleep 30"]
    env:
      vars:
        TARGET: "{{{{server.url}}}}/webhook"
"#
        ),
    );

    let config = load_config(config.to_str()).unwrap();
    let supervisor = Supervisor::new(&config).unwrap();
    let token = supervisor.shutdown_token();
    let runner = run_in_background(supervisor);

    let stdout = wait_for_lines(&dir.path().join("logs/tunnel.stdout.log"), 1);
    assert_eq!(
        stdout,
        vec![format!("forwarding to http://127.0.0.1:{port}/webhook")]
    );
    let stderr = wait_for_lines(&dir.path().join("logs/tunnel.stderr.log"), 1);
    assert_eq!(stderr, vec![port.to_string()]);

    let state_path = dir.path().join("run/state.json");
    let snapshot = StateSnapshot::load(&state_path).unwrap();
    assert_eq!(snapshot.get("server").unwrap().state, ProcessState::Ready);
    assert!(snapshot.get("server").unwrap().pid.is_some());

    token.request();
    let (_, result) = runner.join().unwrap();
    result.unwrap();
    drop(listener);

    let snapshot = StateSnapshot::load(&state_path).unwrap();
    for process in &snapshot.processes {
        assert_eq!(process.state, ProcessState::Stopped, "{}", process.name);
        assert_eq!(process.pid, None);
    }
    assert!(fs::metadata(dir.path().join("logs")).unwrap().is_dir());
}
