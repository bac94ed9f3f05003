#![allow(dead_code)]

use std::{
    fs,
    net::TcpListener,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use tether::{
    backoff::Backoff,
    error::SupervisorError,
    process::ProcessSpec,
    supervisor::{Supervisor, SupervisorSettings},
};

/// Port that was free a moment ago.
pub fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind ephemeral port");
    listener
        .local_addr()
        .expect("listener has no address")
        .port()
}

pub fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("tether.yaml");
    fs::write(&path, body).expect("failed to write config");
    path
}

pub fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        poll_interval: Duration::from_millis(25),
        grace_period: Duration::from_secs(2),
        ..SupervisorSettings::default()
    }
}

/// `sh -c <script>` process with a short restart backoff.
pub fn shell_process(name: &str, script: &str) -> ProcessSpec {
    let mut spec = ProcessSpec::new(name, "sh");
    spec.args = vec!["-c".into(), script.into()];
    spec.restart_backoff = Backoff::new(Duration::from_millis(50), Duration::from_millis(200));
    spec
}

pub type Finished = (Supervisor, Result<(), SupervisorError>);

pub fn run_in_background(mut supervisor: Supervisor) -> thread::JoinHandle<Finished> {
    thread::spawn(move || {
        let result = supervisor.run();
        (supervisor, result)
    })
}

pub fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for {:?} to exist", path);
}

pub fn wait_for_lines(path: &Path, expected: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(content) = fs::read_to_string(path) {
            let lines: Vec<_> = content.lines().map(|line| line.to_string()).collect();
            if lines.len() >= expected {
                return lines;
            }
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for {expected} lines in {:?}", path);
        }

        thread::sleep(Duration::from_millis(25));
    }
}

pub fn wait_for_file_value(path: &Path, expected: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path)
            && content.trim() == expected
        {
            return;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for value '{}' in {:?}", expected, path);
        }

        thread::sleep(Duration::from_millis(25));
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}
