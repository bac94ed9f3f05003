//! State snapshots for `tether status`.
use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::StatusError,
    process::{ProcessHandle, ProcessState},
};

const GREEN_BOLD: &str = "\x1b[1;32m"; // Bright Green
const RED_BOLD: &str = "\x1b[1;31m"; // Bright Red
const MAGENTA_BOLD: &str = "\x1b[1;35m"; // Magenta
const YELLOW_BOLD: &str = "\x1b[1;33m"; // Yellow/Gold
const RESET: &str = "\x1b[0m"; // Reset color

/// Point-in-time view of one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Local>>,
    pub exit_code: Option<i32>,
    pub restarts: u32,
}

impl From<&ProcessHandle> for ProcessStatus {
    fn from(handle: &ProcessHandle) -> Self {
        Self {
            name: handle.name().to_string(),
            state: handle.state(),
            pid: handle.is_alive().then(|| handle.pid()).flatten(),
            started_at: handle.started_at(),
            exit_code: handle.exit_code(),
            restarts: handle.restarts(),
        }
    }
}

/// Snapshot of every process, in start order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub supervisor_pid: u32,
    pub written_at: DateTime<Local>,
    pub processes: Vec<ProcessStatus>,
}

impl StateSnapshot {
    pub fn capture(handles: &[ProcessHandle]) -> Self {
        Self {
            supervisor_pid: std::process::id(),
            written_at: Local::now(),
            processes: handles.iter().map(ProcessStatus::from).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ProcessStatus> {
        self.processes.iter().find(|p| p.name == name)
    }

    /// Writes the snapshot as pretty JSON, replacing any previous file atomically.
    pub fn write(&self, path: &Path) -> Result<(), StatusError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let tmp = tmp_path(path);
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        debug!("Wrote state snapshot to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, StatusError> {
        if !path.exists() {
            return Err(StatusError::NotFound(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Renders a table for terminal output.
    pub fn render_table(&self, color: bool) -> String {
        let width = self
            .processes
            .iter()
            .map(|p| p.name.len())
            .max()
            .unwrap_or(0)
            .max("NAME".len());

        let mut out = format!(
            "Supervisor PID {} (snapshot {})\n{:<width$}  {:<9} {:>8} {:>8} {:>5}  STARTED\n",
            self.supervisor_pid,
            self.written_at.format("%Y-%m-%d %H:%M:%S"),
            "NAME",
            "STATE",
            "PID",
            "RESTARTS",
            "EXIT",
        );

        for process in &self.processes {
            let state = format!("{:<9}", process.state.as_ref());
            let state = if color {
                format!("{}{state}{RESET}", state_color(process.state))
            } else {
                state
            };
            let started = process
                .started_at
                .map(|at| format_elapsed((self.written_at - at).num_seconds().max(0) as u64))
                .unwrap_or_else(|| "-".to_string());

            out.push_str(&format!(
                "{:<width$}  {state} {:>8} {:>8} {:>5}  {started}\n",
                process.name,
                dash_or(process.pid),
                process.restarts,
                dash_or(process.exit_code),
            ));
        }

        out
    }
}

fn state_color(state: ProcessState) -> &'static str {
    match state {
        ProcessState::Ready | ProcessState::Running => GREEN_BOLD,
        ProcessState::Failed => RED_BOLD,
        ProcessState::Starting | ProcessState::Stopping => YELLOW_BOLD,
        ProcessState::Pending | ProcessState::Stopped => MAGENTA_BOLD,
    }
}

fn dash_or<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
}

fn format_elapsed(total_seconds: u64) -> String {
    match total_seconds {
        0..=59 => format!("{} secs ago", total_seconds),
        60..=3_599 => format!("{} mins ago", total_seconds / 60),
        3_600..=86_399 => format!("{} hours ago", total_seconds / 3_600),
        _ => format!("{} days ago", total_seconds / 86_400),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
