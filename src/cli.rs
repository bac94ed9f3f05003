//! Command-line interface for tether.
use std::{fmt, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::config::DEFAULT_CONFIG_FILE;

/// Verbosity given with `--log-level`: `off`, `error`, `warn`, `info`, `debug`, `trace`,
/// or the digits `0` to `5` in that order.
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

/// Accepted level names, indexed by their numeric shorthand.
const LEVELS: [(LevelFilter, &str, &[&str]); 6] = [
    (LevelFilter::OFF, "off", &[]),
    (LevelFilter::ERROR, "error", &["err"]),
    (LevelFilter::WARN, "warn", &["warning"]),
    (LevelFilter::INFO, "info", &["information"]),
    (LevelFilter::DEBUG, "debug", &[]),
    (LevelFilter::TRACE, "trace", &[]),
];

impl LogLevelArg {
    /// Directive handed to `EnvFilter` for supervisor and child output alike.
    pub fn as_str(&self) -> &'static str {
        LEVELS
            .iter()
            .find(|(level, _, _)| *level == self.0)
            .map_or("info", |(_, name, _)| *name)
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = value.parse::<usize>() {
            return LEVELS
                .get(number)
                .map(|(level, _, _)| LogLevelArg(*level))
                .ok_or_else(|| format!("log level {number} is out of range (0-5)"));
        }

        LEVELS
            .iter()
            .find(|(_, name, aliases)| {
                name.eq_ignore_ascii_case(value)
                    || aliases.iter().any(|alias| alias.eq_ignore_ascii_case(value))
            })
            .map(|(level, _, _)| LogLevelArg(*level))
            .ok_or_else(|| format!("unknown log level '{value}'"))
    }
}

/// Which captured stream of a child `tether logs` reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogKind {
    #[default]
    Stdout,
    Stderr,
}

impl LogKind {
    /// Suffix of the file under `log_dir`: `<process>.<kind>.log`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Stdout => "stdout",
            LogKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [LogKind::Stdout, LogKind::Stderr]
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown stream '{s}' (expected stdout or stderr)"))
    }
}

/// Command-line interface for tether.
#[derive(Parser)]
#[command(name = "tether", version, author)]
#[command(
    about = "Starts dependent processes in order and keeps them running together",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for tether.
#[derive(Subcommand)]
pub enum Commands {
    /// Start every configured process in order and supervise them in the foreground.
    Start {
        /// Path to the configuration file (defaults to `tether.yaml`).
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,
    },

    /// Validate a configuration file and print the resolved start order.
    Check {
        /// Path to the configuration file (defaults to `tether.yaml`).
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,
    },

    /// Show the last state snapshot written by a running supervisor.
    Status {
        /// Path to the configuration file, used to locate `settings.state_file`.
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,

        /// Read this snapshot file instead of the configured one.
        #[arg(long, value_name = "PATH")]
        state: Option<String>,

        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,

        /// Disable ANSI colors in output.
        #[arg(long = "no-color")]
        no_color: bool,
    },

    /// Show captured output of a process.
    Logs {
        /// Path to the configuration file, used to locate `settings.log_dir`.
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,

        /// Name of the process.
        process: String,

        /// Number of lines to show.
        #[arg(short, long, default_value = "50")]
        lines: usize,

        /// Stream to show: stdout or stderr.
        #[arg(short = 'k', long, default_value_t = LogKind::default())]
        kind: LogKind,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
