//! Error handling for tether.
use std::{io, path::PathBuf, time::Duration};

use chrono::{DateTime, Local};
use thiserror::Error;

/// Errors raised while loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// Path that could not be read.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A `${VAR}` reference names a variable that is not set.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A duration string could not be parsed.
    #[error("Invalid duration value: '{0}'")]
    InvalidDuration(String),

    /// The configuration parsed but describes something the supervisor cannot run.
    #[error("Invalid configuration for '{scope}': {message}")]
    Invalid {
        /// Process name, or `settings` for supervisor-wide options.
        scope: String,
        /// Human-readable description of the problem.
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(scope: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            scope: scope.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced by the supervisor runtime.
///
/// Every process-level variant carries the process name, the local time the failure was
/// observed and, where one exists, the last exit code.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The configuration could not be loaded or resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The OS refused to create the process.
    #[error("Failed to start process '{process}' at {at}: {source}")]
    Spawn {
        /// Process that failed to spawn.
        process: String,
        /// When the failure was observed.
        at: DateTime<Local>,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The process started but its readiness check never passed.
    #[error(
        "Process '{process}' did not become ready within {waited:?} (at {at}){}",
        last_error_suffix(.last_error)
    )]
    ReadinessTimeout {
        /// Process that never became ready.
        process: String,
        /// When the failure was observed.
        at: DateTime<Local>,
        /// Total time spent probing.
        waited: Duration,
        /// Description of the last failed probe, if any.
        last_error: Option<String>,
    },

    /// The process exited while its readiness check was still pending.
    #[error(
        "Process '{process}' exited before becoming ready at {at} (exit code {})",
        exit_code_label(.exit_code)
    )]
    ExitedBeforeReady {
        /// Process that exited.
        process: String,
        /// When the exit was observed.
        at: DateTime<Local>,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
    },

    /// A ready process exited and its restart policy does not allow another attempt.
    #[error(
        "Process '{process}' exited unexpectedly at {at} (exit code {})",
        exit_code_label(.exit_code)
    )]
    UnexpectedExit {
        /// Process that exited.
        process: String,
        /// When the exit was observed.
        at: DateTime<Local>,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
    },

    /// A process kept exiting after using up its restart attempts.
    #[error(
        "Process '{process}' exceeded its restart budget of {max_restarts} at {at} (last exit code {})",
        exit_code_label(.exit_code)
    )]
    RestartBudgetExceeded {
        /// Process that gave up.
        process: String,
        /// When the final exit was observed.
        at: DateTime<Local>,
        /// Configured number of restart attempts.
        max_restarts: u32,
        /// Exit code of the final run, if the process exited normally.
        exit_code: Option<i32>,
    },

    /// The readiness probe could not be constructed.
    #[error("Failed to prepare readiness check for '{process}': {source}")]
    Probe {
        /// Process whose probe failed.
        process: String,
        /// The underlying error that occurred.
        #[source]
        source: crate::readiness::ProbeError,
    },

    /// Installing the SIGINT/SIGTERM handler failed.
    #[error("Failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    /// Generic I/O failure outside of a specific process.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SupervisorError {
    /// Maps the error onto the process exit code reported by the CLI.
    ///
    /// `1` spawn failure, `2` readiness failure, `3` unexpected exit or exhausted restart
    /// budget, `4` configuration error, `5` anything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            SupervisorError::Spawn { .. } => 1,
            SupervisorError::ReadinessTimeout { .. }
            | SupervisorError::ExitedBeforeReady { .. }
            | SupervisorError::Probe { .. } => 2,
            SupervisorError::UnexpectedExit { .. }
            | SupervisorError::RestartBudgetExceeded { .. } => 3,
            SupervisorError::Config(_) => 4,
            SupervisorError::Signal(_) | SupervisorError::Io(_) => 5,
        }
    }

    /// Name of the process the failure belongs to, if any.
    pub fn process(&self) -> Option<&str> {
        match self {
            SupervisorError::Spawn { process, .. }
            | SupervisorError::ReadinessTimeout { process, .. }
            | SupervisorError::ExitedBeforeReady { process, .. }
            | SupervisorError::UnexpectedExit { process, .. }
            | SupervisorError::RestartBudgetExceeded { process, .. }
            | SupervisorError::Probe { process, .. } => Some(process),
            SupervisorError::Config(_)
            | SupervisorError::Signal(_)
            | SupervisorError::Io(_) => None,
        }
    }
}

/// Formats an optional exit code for error messages.
fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(err) => format!(": {err}"),
        None => String::new(),
    }
}

/// Error type for state snapshot operations.
#[derive(Debug, Error)]
pub enum StatusError {
    /// Error reading or writing the snapshot file.
    #[error("Failed to access state file: {0}")]
    Io(#[from] io::Error),

    /// Error encoding or decoding the snapshot.
    #[error("Failed to parse state file: {0}")]
    Parse(#[from] serde_json::Error),

    /// No snapshot exists at the requested path.
    #[error("No state file found at {0}")]
    NotFound(PathBuf),
}
