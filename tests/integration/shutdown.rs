#[path = "common/mod.rs"]
mod common;

use std::{
    net::TcpListener,
    thread,
    time::{Duration, Instant},
};

use common::{fast_settings, is_process_alive, run_in_background, shell_process, unused_port};
use tether::{
    process::ProcessState, readiness::ReadinessCheck, supervisor::Supervisor,
};

#[test]
fn later_process_is_stopped_before_earlier_one_stops() {
    let specs = vec![
        shell_process("server", "sleep 30"),
        shell_process("tunnel", "sleep 30"),
    ];
    let supervisor = Supervisor::from_parts(specs, fast_settings());
    let token = supervisor.shutdown_token();
    let runner = run_in_background(supervisor);

    thread::sleep(Duration::from_millis(300));
    token.request();
    let (supervisor, result) = runner.join().unwrap();
    result.unwrap();

    let server = supervisor.handle("server").unwrap();
    let tunnel = supervisor.handle("tunnel").unwrap();
    assert!(
        tunnel.first_entered(ProcessState::Stopped).unwrap()
            <= server.first_entered(ProcessState::Stopping).unwrap()
    );
    for handle in [server, tunnel] {
        assert_eq!(handle.state(), ProcessState::Stopped);
        assert!(!is_process_alive(handle.pid().unwrap()));
    }
}

#[test]
fn repeated_shutdown_requests_are_idempotent() {
    let supervisor =
        Supervisor::from_parts(vec![shell_process("server", "sleep 30")], fast_settings());
    let token = supervisor.shutdown_token();
    let runner = run_in_background(supervisor);

    thread::sleep(Duration::from_millis(200));
    assert!(token.request());
    assert!(!token.request());
    assert!(!token.clone().request());

    let (supervisor, result) = runner.join().unwrap();
    result.unwrap();

    let server = supervisor.handle("server").unwrap();
    let stops = server
        .history()
        .iter()
        .filter(|t| t.to == ProcessState::Stopping)
        .count();
    assert_eq!(stops, 1);
}

#[test]
fn shutdown_interrupts_readiness_wait() {
    let mut server = shell_process("server", "sleep 30");
    server.readiness = ReadinessCheck::TcpConnect {
        host: "127.0.0.1".into(),
        port: unused_port(),
    };
    server.retry.max_wait = Duration::from_secs(60);
    let tunnel = shell_process("tunnel", "sleep 30");

    let supervisor = Supervisor::from_parts(vec![server, tunnel], fast_settings());
    let token = supervisor.shutdown_token();
    let runner = run_in_background(supervisor);

    thread::sleep(Duration::from_millis(300));
    let requested = Instant::now();
    token.request();
    let (supervisor, result) = runner.join().unwrap();
    result.unwrap();

    assert!(requested.elapsed() < Duration::from_secs(5));
    assert_eq!(
        supervisor.handle("server").unwrap().state(),
        ProcessState::Stopped
    );
    assert_eq!(
        supervisor.handle("tunnel").unwrap().state(),
        ProcessState::Pending
    );
}

#[test]
fn shutdown_is_observed_during_hanging_http_attempt() {
    // Accepts through the backlog, never answers.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut server = shell_process("server", "sleep 30");
    server.readiness = ReadinessCheck::HttpGet {
        url: format!("http://127.0.0.1:{port}/health"),
        expected_status: 200,
    };
    server.retry.attempt_timeout = Duration::from_secs(8);
    server.retry.max_wait = Duration::from_secs(60);

    let supervisor = Supervisor::from_parts(vec![server], fast_settings());
    let token = supervisor.shutdown_token();
    let runner = run_in_background(supervisor);

    thread::sleep(Duration::from_millis(500));
    let requested = Instant::now();
    token.request();
    let (supervisor, result) = runner.join().unwrap();
    result.unwrap();

    assert!(
        requested.elapsed() < Duration::from_secs(1),
        "shutdown took {:?}",
        requested.elapsed()
    );
    assert_eq!(
        supervisor.handle("server").unwrap().state(),
        ProcessState::Stopped
    );
    drop(listener);
}

#[test]
fn shutdown_interrupts_restart_backoff() {
    let mut flaky = shell_process("flaky", "sleep 0.1; exit 1");
    flaky.restart = tether::process::RestartPolicy::Always;
    flaky.restart_backoff = tether::backoff::Backoff::new(
        Duration::from_secs(30),
        Duration::from_secs(30),
    );

    let supervisor = Supervisor::from_parts(vec![flaky], fast_settings());
    let token = supervisor.shutdown_token();
    let runner = run_in_background(supervisor);

    thread::sleep(Duration::from_millis(500));
    let requested = Instant::now();
    token.request();
    let (supervisor, result) = runner.join().unwrap();
    result.unwrap();

    assert!(requested.elapsed() < Duration::from_secs(2));
    let flaky = supervisor.handle("flaky").unwrap();
    assert_eq!(flaky.state(), ProcessState::Failed);
    assert_eq!(flaky.restarts(), 0);
}
