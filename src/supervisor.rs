//! Ordered process supervision.
//!
//! A [`Supervisor`] owns every [`ProcessHandle`] and drives them from a single coordinating
//! thread. Processes are started one at a time in rank order; each one must be `Ready` before
//! the next is spawned. Exits are reported by per-child monitor threads over a channel, so the
//! coordinator keeps reacting to them while it waits on readiness checks, restart backoff or a
//! graceful stop.
use std::{
    collections::HashMap,
    ops::ControlFlow,
    path::PathBuf,
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use chrono::Local;
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::{Pid, getpgid, getpgrp},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    endpoint::Endpoint,
    error::{ConfigError, SupervisorError},
    monitor::{self, ExitEvent},
    process::{ProcessHandle, ProcessSpec, ProcessState, RestartDecision},
    readiness::{self, WaitOutcome},
    shutdown::ShutdownToken,
    spawn,
    status::StateSnapshot,
};

/// How long to wait for a process to disappear after SIGKILL.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Supervisor-wide runtime options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Interval at which children are polled and the shutdown flag is observed.
    pub poll_interval: Duration,
    /// Wait between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    /// Stop earlier processes too when a later one fails for good.
    pub stop_on_dependent_failure: bool,
    /// Directory for captured child output.
    pub log_dir: Option<PathBuf>,
    /// Path of the JSON state snapshot.
    pub state_file: Option<PathBuf>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            grace_period: Duration::from_secs(10),
            stop_on_dependent_failure: false,
            log_dir: None,
            state_file: None,
        }
    }
}

/// Why a wait was cut short.
#[derive(Debug)]
enum Interrupt {
    /// Shutdown was requested.
    Shutdown,
    /// The watched child exited.
    Exited(ExitEvent),
    /// Another process failed for good.
    Aborted,
}

/// Coordinates startup, monitoring, restarts and shutdown of an ordered set of processes.
pub struct Supervisor {
    specs: Vec<ProcessSpec>,
    handles: Vec<ProcessHandle>,
    settings: SupervisorSettings,
    shutdown: ShutdownToken,
    events_tx: Sender<ExitEvent>,
    events_rx: Receiver<ExitEvent>,
    endpoints: HashMap<String, Endpoint>,
    /// Scheduled restarts as `(index, due)`.
    pending_restarts: Vec<(usize, Instant)>,
    /// Terminal failures whose dependents have not been stopped yet.
    pending_failures: Vec<usize>,
    /// Readiness waits cut short by a terminal failure elsewhere, as `(index, generation)`.
    pending_readiness: Vec<(usize, u64)>,
    /// First terminal failure; decides the exit code.
    failure: Option<SupervisorError>,
    shutting_down: bool,
    monitors: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Builds a supervisor from a loaded configuration.
    pub fn new(config: &Config) -> Result<Self, SupervisorError> {
        let specs = config.process_specs()?;
        let settings = config.supervisor_settings()?;
        Ok(Self::from_parts(specs, settings))
    }

    /// Builds a supervisor from resolved specs. Specs are ordered by `rank`, ties keeping
    /// their given order.
    pub fn from_parts(mut specs: Vec<ProcessSpec>, settings: SupervisorSettings) -> Self {
        specs.sort_by_key(|spec| spec.rank);
        for (rank, spec) in specs.iter_mut().enumerate() {
            spec.rank = rank;
        }

        let handles = specs
            .iter()
            .map(|spec| ProcessHandle::new(spec.name.clone()))
            .collect();
        let (events_tx, events_rx) = mpsc::channel();

        Self {
            specs,
            handles,
            settings,
            shutdown: ShutdownToken::new(),
            events_tx,
            events_rx,
            endpoints: HashMap::new(),
            pending_restarts: Vec::new(),
            pending_failures: Vec::new(),
            pending_readiness: Vec::new(),
            failure: None,
            shutting_down: false,
            monitors: Vec::new(),
        }
    }

    /// Token that requests shutdown when triggered; safe to hand to other threads.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Handles in start order.
    pub fn handles(&self) -> &[ProcessHandle] {
        &self.handles
    }

    pub fn handle(&self, name: &str) -> Option<&ProcessHandle> {
        self.handles.iter().find(|h| h.name() == name)
    }

    pub fn specs(&self) -> &[ProcessSpec] {
        &self.specs
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::capture(&self.handles)
    }

    /// Starts every process, supervises them until shutdown or until nothing is left running,
    /// then stops everything in reverse order.
    ///
    /// Returns the startup failure, or the first terminal runtime failure, if any.
    pub fn run(&mut self) -> Result<(), SupervisorError> {
        info!("Starting {} process(es)", self.specs.len());

        let result = self.start_all();
        match &result {
            Ok(()) if !self.shutdown.is_requested() => {
                info!("All processes ready");
                self.supervise();
            }
            Ok(()) => info!("Shutdown requested during startup"),
            Err(err) => error!("Startup failed: {err}"),
        }

        self.shutdown_all();
        self.join_monitors();

        match result {
            Err(err) => Err(err),
            Ok(()) => match self.failure.take() {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    fn start_all(&mut self) -> Result<(), SupervisorError> {
        for index in 0..self.specs.len() {
            if self.shutdown.is_requested() {
                return Ok(());
            }
            self.bring_up(index)?;
            if !self.pending_failures.is_empty()
                && let Some(err) = self.failure.take()
            {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Spawns the process at `index` and waits for it to become ready.
    ///
    /// Returns `Ok` without reaching `Ready` when the wait was interrupted by shutdown or by a
    /// terminal failure elsewhere. The latter queues the wait in `pending_readiness`.
    fn bring_up(&mut self, index: usize) -> Result<(), SupervisorError> {
        let spec = self.specs[index].clone();
        self.set_state(index, ProcessState::Starting);

        let invocation = match spawn::prepare(&spec, &self.endpoints) {
            Ok(invocation) => invocation,
            Err(raw) => {
                self.set_state(index, ProcessState::Failed);
                return Err(ConfigError::invalid(
                    &spec.name,
                    format!("{raw} has no published endpoint"),
                )
                .into());
            }
        };

        let child = match spawn::launch(
            &spec.name,
            &invocation,
            self.settings.log_dir.as_deref(),
        ) {
            Ok(child) => child,
            Err(source) => {
                self.set_state(index, ProcessState::Failed);
                return Err(SupervisorError::Spawn {
                    process: spec.name.clone(),
                    at: Local::now(),
                    source,
                });
            }
        };

        let pid = child.id();
        let generation = self.handles[index].mark_spawned(pid);
        self.monitors.push(monitor::watch(
            index,
            generation,
            child,
            self.settings.poll_interval,
            self.events_tx.clone(),
        ));
        self.set_state(index, ProcessState::Running);
        info!(
            "Process '{}' running with PID {pid}; waiting for {}",
            spec.name,
            spec.readiness.describe()
        );

        self.await_ready(index, generation)
    }

    /// Waits for the `Running` child at `index` to pass its readiness check.
    fn await_ready(&mut self, index: usize, generation: u64) -> Result<(), SupervisorError> {
        let spec = self.specs[index].clone();
        let outcome = readiness::wait_until_ready(&spec.readiness, &spec.retry, |delay| {
            self.pause(delay, Some((index, generation)))
        });

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(source) => {
                self.set_state(index, ProcessState::Failed);
                self.terminate(index);
                return Err(SupervisorError::Probe {
                    process: spec.name.clone(),
                    source,
                });
            }
        };

        match outcome {
            WaitOutcome::Ready { attempts, waited } => {
                self.set_state(index, ProcessState::Ready);
                info!(
                    "Process '{}' ready after {waited:?} ({attempts} probe attempt(s))",
                    spec.name
                );
                if let Some(endpoint) = spec.endpoint {
                    debug!("Publishing endpoint {endpoint} for '{}'", spec.name);
                    self.endpoints.insert(spec.name, endpoint);
                }
                Ok(())
            }
            WaitOutcome::TimedOut {
                attempts,
                waited,
                last_error,
            } => {
                debug!("'{}' gave up after {attempts} probe attempt(s)", spec.name);
                self.set_state(index, ProcessState::Failed);
                self.terminate(index);
                Err(SupervisorError::ReadinessTimeout {
                    process: spec.name,
                    at: Local::now(),
                    waited,
                    last_error: last_error.map(|err| err.to_string()),
                })
            }
            WaitOutcome::Interrupted(Interrupt::Exited(event)) => {
                self.handles[index].mark_reaped(event.exit_code);
                self.set_state(index, ProcessState::Failed);
                Err(SupervisorError::ExitedBeforeReady {
                    process: spec.name,
                    at: event.timestamp,
                    exit_code: event.exit_code,
                })
            }
            WaitOutcome::Interrupted(Interrupt::Aborted) if !self.shutting_down => {
                debug!("Readiness wait for '{}' deferred", spec.name);
                self.pending_readiness.push((index, generation));
                Ok(())
            }
            WaitOutcome::Interrupted(reason) => {
                debug!("Readiness wait for '{}' interrupted: {reason:?}", spec.name);
                Ok(())
            }
        }
    }

    /// Sleeps for `delay` while handling exit reports.
    ///
    /// Breaks early on shutdown, on a new terminal failure, or when the `watched` child exits.
    fn pause(
        &mut self,
        delay: Duration,
        watched: Option<(usize, u64)>,
    ) -> ControlFlow<Interrupt> {
        let deadline = Instant::now() + delay;
        loop {
            if self.shutdown.is_requested() {
                return ControlFlow::Break(Interrupt::Shutdown);
            }
            if !self.pending_failures.is_empty() {
                return ControlFlow::Break(Interrupt::Aborted);
            }

            let wait = deadline.saturating_duration_since(Instant::now());
            match self
                .events_rx
                .recv_timeout(wait.min(self.settings.poll_interval))
            {
                Ok(event) if Some((event.index, event.generation)) == watched => {
                    return ControlFlow::Break(Interrupt::Exited(event));
                }
                Ok(event) => self.on_exit(event),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }

            if Instant::now() >= deadline {
                return ControlFlow::Continue(());
            }
        }
    }

    /// Handles an exit report for a child nobody is waiting on.
    fn on_exit(&mut self, event: ExitEvent) {
        let Some(handle) = self.handles.get_mut(event.index) else {
            return;
        };
        if event.generation != handle.generation() || !handle.is_alive() {
            debug!(
                "Ignoring stale exit report for '{}' (PID {})",
                handle.name(),
                event.pid
            );
            return;
        }

        handle.mark_reaped(event.exit_code);
        match handle.state() {
            ProcessState::Ready | ProcessState::Running => self.on_unexpected_exit(event),
            state => debug!(
                "Process '{}' (PID {}) exited with {} while {state}",
                handle.name(),
                event.pid,
                event.describe()
            ),
        }
    }

    fn on_unexpected_exit(&mut self, event: ExitEvent) {
        let index = event.index;
        let name = self.specs[index].name.clone();
        let was_ready = self.handles[index].state() == ProcessState::Ready;

        if self.shutting_down {
            warn!(
                "Process '{name}' exited with {} during shutdown",
                event.describe()
            );
            self.set_state(index, ProcessState::Failed);
            return;
        }

        let restarts = self.handles[index].restarts();
        let policy = self.specs[index].restart;
        match policy.decide(event.success, restarts) {
            RestartDecision::Completed => {
                info!("Process '{name}' exited cleanly; not restarting");
                let next = if was_ready {
                    ProcessState::Stopped
                } else {
                    ProcessState::Failed
                };
                self.set_state(index, next);
            }
            RestartDecision::Restart => {
                self.set_state(index, ProcessState::Failed);
                self.schedule_restart(index, &format!("exited with {}", event.describe()));
            }
            RestartDecision::Fatal => {
                self.set_state(index, ProcessState::Failed);
                self.fail_terminally(
                    index,
                    SupervisorError::UnexpectedExit {
                        process: name,
                        at: event.timestamp,
                        exit_code: event.exit_code,
                    },
                );
            }
            RestartDecision::BudgetExceeded => {
                self.set_state(index, ProcessState::Failed);
                self.fail_terminally(
                    index,
                    SupervisorError::RestartBudgetExceeded {
                        process: name,
                        at: event.timestamp,
                        max_restarts: policy.max_attempts().unwrap_or(restarts),
                        exit_code: event.exit_code,
                    },
                );
            }
        }
    }

    fn schedule_restart(&mut self, index: usize, reason: &str) {
        let attempt = self.handles[index].restarts() + 1;
        let delay = self.specs[index].restart_backoff.delay_for_attempt(attempt);
        warn!(
            "Process '{}' {reason}; restart {attempt} in {delay:?}",
            self.specs[index].name
        );
        self.pending_restarts.push((index, Instant::now() + delay));
    }

    fn fail_terminally(&mut self, index: usize, err: SupervisorError) {
        error!("{err}");
        self.pending_restarts.retain(|(pending, _)| *pending != index);
        self.pending_failures.push(index);
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    fn run_due_restarts(&mut self) {
        while let Some(pos) = self
            .pending_restarts
            .iter()
            .position(|(_, due)| *due <= Instant::now())
        {
            if self.shutdown.is_requested() || !self.pending_failures.is_empty() {
                return;
            }
            let (index, _) = self.pending_restarts.remove(pos);
            self.restart_process(index);
        }
    }

    /// Respawns a failed process. A failed attempt still counts against the budget.
    fn restart_process(&mut self, index: usize) {
        let attempt = self.handles[index].record_restart();
        let name = self.specs[index].name.clone();
        info!("Restarting '{name}' (restart {attempt})");

        if let Err(err) = self.bring_up(index) {
            self.restart_failed(index, attempt, err);
        }
    }

    /// Resumes a readiness wait deferred while dependents of a failed process were stopped.
    fn resume_readiness(&mut self, index: usize, generation: u64) {
        let handle = &self.handles[index];
        if handle.state() != ProcessState::Running
            || !handle.is_alive()
            || handle.generation() != generation
        {
            return;
        }

        info!("Resuming readiness wait for '{}'", self.specs[index].name);
        if let Err(err) = self.await_ready(index, generation) {
            let attempt = self.handles[index].restarts();
            self.restart_failed(index, attempt, err);
        }
    }

    fn restart_failed(&mut self, index: usize, attempt: u32, err: SupervisorError) {
        let name = self.specs[index].name.clone();
        if matches!(err, SupervisorError::Config(_)) {
            self.fail_terminally(index, err);
            return;
        }

        let policy = self.specs[index].restart;
        match policy.decide(false, attempt) {
            RestartDecision::Restart => {
                self.schedule_restart(index, &format!("failed to restart ({err})"));
            }
            _ => {
                warn!("Restart of '{name}' failed: {err}");
                self.fail_terminally(
                    index,
                    SupervisorError::RestartBudgetExceeded {
                        process: name,
                        at: Local::now(),
                        max_restarts: policy.max_attempts().unwrap_or(attempt),
                        exit_code: self.handles[index].exit_code(),
                    },
                );
            }
        }
    }

    /// Reacts to exits until shutdown is requested or nothing is left running.
    fn supervise(&mut self) {
        loop {
            if self.shutdown.is_requested() {
                info!("Shutdown requested");
                return;
            }
            if let Some(index) = self.pending_failures.pop() {
                self.stop_dependents(index);
                continue;
            }
            if let Some((index, generation)) = self.pending_readiness.pop() {
                self.resume_readiness(index, generation);
                continue;
            }

            self.run_due_restarts();
            if self.shutdown.is_requested() || !self.pending_failures.is_empty() {
                continue;
            }

            if self.pending_restarts.is_empty()
                && !self.handles.iter().any(ProcessHandle::is_alive)
            {
                info!("No managed processes left running");
                return;
            }

            let now = Instant::now();
            let wait = self
                .pending_restarts
                .iter()
                .map(|(_, due)| due.saturating_duration_since(now))
                .min()
                .unwrap_or(self.settings.poll_interval)
                .min(self.settings.poll_interval);
            if let Ok(event) = self.events_rx.recv_timeout(wait) {
                self.on_exit(event);
            }
        }
    }

    /// Stops every process started after `index`, newest first. Earlier processes follow when
    /// `stop_on_dependent_failure` is set.
    fn stop_dependents(&mut self, index: usize) {
        let name = self.specs[index].name.clone();
        let mut targets: Vec<usize> = (index + 1..self.specs.len()).rev().collect();
        if self.settings.stop_on_dependent_failure {
            targets.extend((0..index).rev());
        }

        if !targets.is_empty() {
            warn!("'{name}' failed; stopping {} dependent process(es)", targets.len());
        }
        for target in targets {
            self.pending_restarts.retain(|(pending, _)| *pending != target);
            self.stop_process(target);
        }
    }

    /// Stops everything in reverse start order.
    fn shutdown_all(&mut self) {
        self.shutting_down = true;
        self.pending_restarts.clear();
        for index in (0..self.handles.len()).rev() {
            self.stop_process(index);
        }
        info!("All processes stopped");
    }

    /// Gracefully stops one process. Calling it on a process that is not running is a no-op.
    fn stop_process(&mut self, index: usize) {
        let state = self.handles[index].state();
        if !matches!(state, ProcessState::Running | ProcessState::Ready) {
            if self.handles[index].is_alive() {
                self.terminate(index);
            }
            return;
        }

        let name = self.specs[index].name.clone();
        info!("Stopping '{name}'");
        self.set_state(index, ProcessState::Stopping);
        self.terminate(index);
        self.set_state(index, ProcessState::Stopped);

        let exit = match self.handles[index].exit_code() {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };
        info!("Process '{name}' stopped ({exit})");
    }

    /// SIGTERM, then SIGKILL after the grace period. Does not change the lifecycle state.
    fn terminate(&mut self, index: usize) {
        let handle = &self.handles[index];
        let (Some(pid), true) = (handle.pid(), handle.is_alive()) else {
            return;
        };
        let generation = handle.generation();
        let name = handle.name().to_string();

        send_signal(&name, pid, Signal::SIGTERM);
        if self.await_exit(index, generation, self.settings.grace_period) {
            return;
        }

        warn!(
            "Process '{name}' did not exit within {:?}; sending SIGKILL",
            self.settings.grace_period
        );
        send_signal(&name, pid, Signal::SIGKILL);
        if !self.await_exit(index, generation, KILL_TIMEOUT) {
            error!("Process '{name}' (PID {pid}) still running after SIGKILL");
        }
    }

    /// Waits for the exit report of one child, handling other reports meanwhile.
    fn await_exit(&mut self, index: usize, generation: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let handle = &self.handles[index];
            if !handle.is_alive() || handle.generation() != generation {
                return true;
            }

            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                return false;
            }

            match self
                .events_rx
                .recv_timeout(wait.min(self.settings.poll_interval))
            {
                Ok(event) if event.index == index && event.generation == generation => {
                    self.handles[index].mark_reaped(event.exit_code);
                    return true;
                }
                Ok(event) => self.on_exit(event),
                Err(_) => {}
            }
        }
    }

    fn set_state(&mut self, index: usize, next: ProcessState) {
        if self.handles[index].transition(next) {
            self.write_snapshot();
        }
    }

    fn write_snapshot(&self) {
        if let Some(path) = &self.settings.state_file
            && let Err(err) = self.snapshot().write(path)
        {
            warn!("Failed to write state snapshot: {err}");
        }
    }

    fn join_monitors(&mut self) {
        for monitor in self.monitors.drain(..) {
            if monitor.is_finished() {
                let _ = monitor.join();
            } else {
                debug!("Leaving unfinished monitor thread detached");
            }
        }
    }
}

fn send_signal(name: &str, pid: u32, sig: Signal) {
    let target = Pid::from_raw(pid as i32);

    if let Ok(pgid) = getpgid(Some(target))
        && pgid != getpgrp()
    {
        match signal::killpg(pgid, sig) {
            Ok(()) => debug!("Sent {sig} to process group {pgid} of '{name}'"),
            Err(Errno::ESRCH) => debug!("Process group of '{name}' already gone"),
            Err(err) => warn!("Failed to signal process group {pgid} of '{name}': {err}"),
        }
    }

    match signal::kill(target, sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!("Failed to send {sig} to '{name}' (PID {pid}): {err}"),
    }
}
