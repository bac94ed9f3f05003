#[path = "common/mod.rs"]
mod common;

use std::{thread, time::Duration};

use common::{fast_settings, run_in_background, shell_process, wait_for_lines};
use tempfile::tempdir;
use tether::{
    error::SupervisorError,
    process::{ProcessState, RestartPolicy},
    supervisor::{Supervisor, SupervisorSettings},
};

#[test]
fn on_failure_stops_after_restart_budget() {
    let dir = tempdir().unwrap();
    let runs = dir.path().join("runs");

    let mut server = shell_process(
        "server",
        &format!("echo run >> {}; sleep 0.2; exit 1", runs.display()),
    );
    server.restart = RestartPolicy::OnFailure { max_attempts: 2 };

    let mut supervisor = Supervisor::from_parts(vec![server], fast_settings());
    let err = supervisor.run().unwrap_err();

    assert!(matches!(
        err,
        SupervisorError::RestartBudgetExceeded {
            max_restarts: 2,
            exit_code: Some(1),
            ..
        }
    ));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(wait_for_lines(&runs, 3).len(), 3);

    let handle = supervisor.handle("server").unwrap();
    assert_eq!(handle.restarts(), 2);
    assert_eq!(handle.state(), ProcessState::Failed);

    // Every run went through readiness again before the next failure.
    let readies = handle
        .history()
        .iter()
        .filter(|t| t.to == ProcessState::Ready)
        .count();
    assert_eq!(readies, 3);
}

#[test]
fn never_policy_exit_is_fatal() {
    let server = shell_process("server", "sleep 0.3; exit 0");
    let tunnel = shell_process("tunnel", "sleep 30");

    let mut supervisor = Supervisor::from_parts(vec![server, tunnel], fast_settings());
    let err = supervisor.run().unwrap_err();

    assert!(matches!(
        err,
        SupervisorError::UnexpectedExit { ref process, exit_code: Some(0), .. } if process == "server"
    ));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(supervisor.handle("server").unwrap().restarts(), 0);
    assert_eq!(
        supervisor.handle("tunnel").unwrap().state(),
        ProcessState::Stopped
    );
}

#[test]
fn always_policy_restarts_clean_exits() {
    let dir = tempdir().unwrap();
    let runs = dir.path().join("runs");

    let mut worker = shell_process(
        "worker",
        &format!("echo run >> {}; sleep 0.1", runs.display()),
    );
    worker.restart = RestartPolicy::Always;

    let supervisor = Supervisor::from_parts(vec![worker], fast_settings());
    let token = supervisor.shutdown_token();
    let runner = run_in_background(supervisor);

    wait_for_lines(&runs, 3);
    token.request();
    let (supervisor, result) = runner.join().unwrap();
    result.unwrap();

    assert!(supervisor.handle("worker").unwrap().restarts() >= 2);
}

#[test]
fn failing_dependent_leaves_earlier_processes_running() {
    let server = shell_process("server", "sleep 30");
    let tunnel = shell_process("tunnel", "sleep 0.3; exit 2");

    let supervisor = Supervisor::from_parts(vec![server, tunnel], fast_settings());
    let token = supervisor.shutdown_token();
    let runner = run_in_background(supervisor);

    thread::sleep(Duration::from_millis(1000));
    assert!(!runner.is_finished(), "supervisor should keep the server up");
    token.request();

    let (supervisor, result) = runner.join().unwrap();
    let err = result.unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::UnexpectedExit { ref process, exit_code: Some(2), .. } if process == "tunnel"
    ));

    let server = supervisor.handle("server").unwrap();
    let tunnel = supervisor.handle("tunnel").unwrap();
    assert_eq!(tunnel.state(), ProcessState::Failed);
    assert_eq!(server.state(), ProcessState::Stopped);
    assert!(
        server.first_entered(ProcessState::Stopping).unwrap()
            > tunnel.first_entered(ProcessState::Failed).unwrap()
    );
}

#[test]
fn cascade_stops_earlier_processes_when_enabled() {
    let server = shell_process("server", "sleep 30");
    let tunnel = shell_process("tunnel", "sleep 0.3; exit 2");
    let settings = SupervisorSettings {
        stop_on_dependent_failure: true,
        ..fast_settings()
    };

    let mut supervisor = Supervisor::from_parts(vec![server, tunnel], settings);
    let err = supervisor.run().unwrap_err();

    assert_eq!(err.exit_code(), 3);
    assert_eq!(err.process(), Some("tunnel"));
    assert_eq!(
        supervisor.handle("server").unwrap().state(),
        ProcessState::Stopped
    );
}
