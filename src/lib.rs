//! tether starts a small set of dependent processes in order, waits for each one to become
//! ready before starting the next, keeps them running under a restart policy, and stops them
//! in reverse order. It replaces "start the server, sleep a bit, start the tunnel" scripts
//! with readiness checks that actually observe the server.

/// Bounded exponential backoff.
pub mod backoff;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Endpoints and `{{name.field}}` placeholders.
pub mod endpoint;

/// Error handling.
pub mod error;

/// Child output capture.
pub mod logs;

/// Per-child exit monitoring.
pub mod monitor;

/// Process specs, handles and lifecycle states.
pub mod process;

/// Readiness checks.
pub mod readiness;

/// Shutdown requests and signal handling.
pub mod shutdown;

/// Launching child processes.
pub mod spawn;

/// State snapshots.
pub mod status;

/// Ordered process supervisor.
pub mod supervisor;

#[cfg(test)]
pub mod test_utils;
