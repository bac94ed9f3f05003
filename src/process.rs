//! Process specifications and the per-process lifecycle state machine.
use std::{
    collections::BTreeMap,
    path::PathBuf,
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, warn};

use crate::{
    backoff::Backoff,
    endpoint::Endpoint,
    readiness::{ReadinessCheck, RetryPolicy},
};

/// Fully resolved description of one managed process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Unique name within the supervisor.
    pub name: String,
    /// Executable to run. Relative paths containing `/` resolve against `cwd`.
    pub command: String,
    /// Arguments, possibly containing endpoint placeholders.
    pub args: Vec<String>,
    /// Working directory for the child.
    pub cwd: PathBuf,
    /// Optional `.env`-style file merged under `env`.
    pub env_file: Option<PathBuf>,
    /// Environment overrides, possibly containing endpoint placeholders.
    pub env: BTreeMap<String, String>,
    /// How readiness is decided.
    pub readiness: ReadinessCheck,
    /// Retry bounds for probing readiness checks.
    pub retry: RetryPolicy,
    /// Endpoint published to later processes once ready.
    pub endpoint: Option<Endpoint>,
    /// What to do when the process exits while it is still required.
    pub restart: RestartPolicy,
    /// Delay schedule between restart attempts.
    pub restart_backoff: Backoff,
    /// Position in the start order (0 starts first).
    pub rank: usize,
}

impl ProcessSpec {
    /// Minimal spec used as a starting point by tests and programmatic callers.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            cwd: PathBuf::from("."),
            env_file: None,
            env: BTreeMap::new(),
            readiness: ReadinessCheck::FixedDelay(Duration::ZERO),
            retry: RetryPolicy::default(),
            endpoint: None,
            restart: RestartPolicy::Never,
            restart_backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
            rank: 0,
        }
    }
}

/// Restart behaviour after an unexpected exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Any exit of a ready process is fatal.
    Never,
    /// Restart after non-zero exits, at most `max_attempts` times in total.
    OnFailure { max_attempts: u32 },
    /// Restart after every exit, without limit.
    Always,
}

/// What the supervisor does with a process that just exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Schedule another run.
    Restart,
    /// Clean exit under `on-failure`; the process is done.
    Completed,
    /// `never` policy: the exit is fatal.
    Fatal,
    /// `on-failure` attempts used up.
    BudgetExceeded,
}

impl RestartPolicy {
    /// Decides what follows an exit, given how many restarts already happened.
    pub fn decide(&self, success: bool, restarts_so_far: u32) -> RestartDecision {
        match self {
            RestartPolicy::Never => RestartDecision::Fatal,
            RestartPolicy::OnFailure { .. } if success => RestartDecision::Completed,
            RestartPolicy::OnFailure { max_attempts } => {
                if restarts_so_far < *max_attempts {
                    RestartDecision::Restart
                } else {
                    RestartDecision::BudgetExceeded
                }
            }
            RestartPolicy::Always => RestartDecision::Restart,
        }
    }

    /// Configured attempt limit, if any.
    pub fn max_attempts(&self) -> Option<u32> {
        match self {
            RestartPolicy::Never => Some(0),
            RestartPolicy::OnFailure { max_attempts } => Some(*max_attempts),
            RestartPolicy::Always => None,
        }
    }
}

/// Lifecycle state of a managed process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessState {
    Pending,
    Starting,
    Running,
    Ready,
    Failed,
    Stopping,
    Stopped,
}

impl ProcessState {
    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Ready)
                | (Running, Failed)
                | (Running, Stopping)
                | (Ready, Failed)
                | (Ready, Stopping)
                | (Ready, Stopped)
                | (Failed, Starting)
                | (Stopping, Stopped)
        )
    }
}

/// One recorded state change.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: ProcessState,
    pub to: ProcessState,
    /// Monotonic time, for ordering comparisons.
    pub at: Instant,
    /// Wall-clock time, for reporting.
    pub timestamp: DateTime<Local>,
}

/// Runtime record of a spec, owned by the supervisor.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    state: ProcessState,
    started_at: Option<DateTime<Local>>,
    exit_code: Option<i32>,
    restarts: u32,
    generation: u64,
    alive: bool,
    history: Vec<Transition>,
}

impl ProcessHandle {
    /// Creates a `Pending` handle.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pid: None,
            state: ProcessState::Pending,
            started_at: None,
            exit_code: None,
            restarts: 0,
            generation: 0,
            alive: false,
            history: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at
    }

    /// Exit code of the most recent run, if it exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Number of restarts performed so far.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Incremented on every spawn; exit reports from older runs carry a stale value.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a spawned child has not been reaped yet.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Monotonic time of the first transition into `state`.
    pub fn first_entered(&self, state: ProcessState) -> Option<Instant> {
        self.history.iter().find(|t| t.to == state).map(|t| t.at)
    }

    /// Monotonic time of the latest transition into `state`.
    pub fn last_entered(&self, state: ProcessState) -> Option<Instant> {
        self.history
            .iter()
            .rev()
            .find(|t| t.to == state)
            .map(|t| t.at)
    }

    /// Moves to `next`, recording the change. Illegal edges are logged and ignored.
    pub fn transition(&mut self, next: ProcessState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                "Ignoring invalid transition for '{}': {} -> {}",
                self.name, self.state, next
            );
            return false;
        }

        debug!("Process '{}': {} -> {}", self.name, self.state, next);
        self.history.push(Transition {
            from: self.state,
            to: next,
            at: Instant::now(),
            timestamp: Local::now(),
        });
        self.state = next;
        true
    }

    /// Records a freshly spawned child.
    pub(crate) fn mark_spawned(&mut self, pid: u32) -> u64 {
        self.generation += 1;
        self.pid = Some(pid);
        self.started_at = Some(Local::now());
        self.exit_code = None;
        self.alive = true;
        self.generation
    }

    /// Records that the child was reaped.
    pub(crate) fn mark_reaped(&mut self, exit_code: Option<i32>) {
        self.alive = false;
        self.exit_code = exit_code;
    }

    pub(crate) fn record_restart(&mut self) -> u32 {
        self.restarts += 1;
        self.restarts
    }
}
