//! Per-child liveness monitoring.
//!
//! Each spawned child is handed to a monitor thread that owns it, polls it, reaps it, and
//! reports the exit to the supervisor over a channel. The supervisor never blocks on a child
//! directly.
use std::{
    os::unix::process::ExitStatusExt,
    process::{Child, ExitStatus},
    sync::mpsc::Sender,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use tracing::{debug, warn};

/// Report sent when a monitored child exits.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    /// Index of the process in start order.
    pub index: usize,
    /// Spawn generation the child belongs to.
    pub generation: u64,
    pub pid: u32,
    /// Exit code, if the child exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
    pub success: bool,
    /// Monotonic time the exit was observed.
    pub at: Instant,
    /// Wall-clock time the exit was observed.
    pub timestamp: DateTime<Local>,
}

impl ExitEvent {
    fn from_status(index: usize, generation: u64, pid: u32, status: ExitStatus) -> Self {
        Self {
            index,
            generation,
            pid,
            exit_code: status.code(),
            signal: status.signal(),
            success: status.success(),
            at: Instant::now(),
            timestamp: Local::now(),
        }
    }

    /// Human-readable exit description, e.g. `exit code 1` or `signal 9`.
    pub fn describe(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("signal {signal}"),
            (None, None) => "unknown status".to_string(),
        }
    }
}

/// Watches `child` until it exits, polling every `poll`.
///
/// The child is always reaped here, even if the supervisor has stopped listening.
pub fn watch(
    index: usize,
    generation: u64,
    mut child: Child,
    poll: Duration,
    events: Sender<ExitEvent>,
) -> JoinHandle<()> {
    let pid = child.id();
    thread::spawn(move || {
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(poll),
                Err(err) => {
                    warn!("Failed to poll PID {pid}: {err}; waiting instead");
                    match child.wait() {
                        Ok(status) => break status,
                        Err(err) => {
                            warn!("Failed to reap PID {pid}: {err}");
                            return;
                        }
                    }
                }
            }
        };

        let event = ExitEvent::from_status(index, generation, pid, status);
        debug!("PID {pid} exited with {}", event.describe());
        if events.send(event).is_err() {
            debug!("Supervisor gone; PID {pid} already reaped");
        }
    })
}
