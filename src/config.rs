//! Configuration management for tether.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};
use strum_macros::{AsRefStr, EnumString};
use tracing::debug;

use crate::{
    backoff::Backoff,
    endpoint::{self, Endpoint},
    error::ConfigError,
    process::{ProcessSpec, RestartPolicy},
    readiness::{ReadinessCheck, RetryPolicy},
    supervisor::SupervisorSettings,
};

/// Config file used when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "tether.yaml";

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
});

static PROCESS_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+$").expect("process name pattern is valid")
});

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// Supervisor-wide options.
    #[serde(default)]
    pub settings: Settings,
    /// Managed processes, in declaration order.
    pub processes: Vec<ProcessConfig>,
    /// Root directory from which relative paths are resolved.
    #[serde(default)]
    pub project_dir: Option<String>,
}

/// Supervisor-wide options.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// Liveness poll interval (default `500ms`).
    pub poll_interval: Option<String>,
    /// Wait between SIGTERM and SIGKILL (default `10s`).
    pub grace_period: Option<String>,
    /// Stop earlier processes when a later one fails for good.
    #[serde(default)]
    pub stop_on_dependent_failure: bool,
    /// Directory for per-process stdout/stderr logs.
    pub log_dir: Option<String>,
    /// Path of the JSON state snapshot.
    pub state_file: Option<String>,
}

/// Configuration for an individual process.
#[derive(Debug, Deserialize, Clone)]
pub struct ProcessConfig {
    /// Unique process name.
    pub name: String,
    /// Executable to run.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, relative to the config file.
    pub cwd: Option<String>,
    /// Optional environment variables for the process.
    pub env: Option<EnvConfig>,
    /// Explicit start-order rank; declaration order breaks ties.
    pub order: Option<i64>,
    /// Readiness check; defaults to "ready once running".
    pub readiness: Option<ReadinessConfig>,
    /// Endpoint published to later processes, overriding the one implied by `readiness`.
    pub endpoint: Option<String>,
    /// Restart policy (`never`, `on-failure`, `always`).
    pub restart_policy: Option<String>,
    /// Restart attempts allowed under `on-failure` (default 3).
    pub max_restarts: Option<u32>,
    /// Initial delay before restarting a failed process (default `1s`).
    pub backoff: Option<String>,
    /// Upper bound for the restart delay (default `30s`).
    pub max_backoff: Option<String>,
}

/// Represents environment variables for a process.
#[derive(Debug, Deserialize, Clone)]
pub struct EnvConfig {
    /// Optional path to an environment file.
    pub file: Option<String>,
    /// Key-value pairs of environment variables.
    pub vars: Option<BTreeMap<String, String>>,
}

impl EnvConfig {
    /// Resolves the full path to the env file based on a base directory.
    pub fn path(&self, base: &Path) -> Option<PathBuf> {
        self.file.as_ref().map(|f| resolve_path(base, f))
    }
}

/// Readiness section of a process.
#[derive(Debug, Deserialize, Clone)]
pub struct ReadinessConfig {
    /// `tcp`, `http` or `delay`.
    #[serde(rename = "type")]
    pub kind: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub expected_status: Option<u16>,
    pub delay: Option<String>,
    /// Per-attempt timeout.
    pub timeout: Option<String>,
    /// Total time allowed before the process counts as failed.
    pub max_wait: Option<String>,
    /// Initial delay between attempts.
    pub backoff: Option<String>,
    /// Upper bound for the delay between attempts.
    pub max_backoff: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ReadinessKind {
    #[strum(serialize = "tcp", serialize = "tcp_connect")]
    Tcp,
    #[strum(serialize = "http", serialize = "http_get")]
    Http,
    #[strum(serialize = "delay", serialize = "fixed_delay")]
    Delay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum RestartMode {
    Never,
    #[strum(serialize = "on-failure", serialize = "on_failure")]
    OnFailure,
    Always,
}

impl Config {
    /// Directory relative paths are resolved against.
    pub fn project_root(&self) -> PathBuf {
        self.project_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Indices into `processes` in start order: ascending `order`, declaration order on ties.
    pub fn start_order(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.processes.len()).collect();
        indices.sort_by_key(|&idx| self.processes[idx].order.unwrap_or(idx as i64));
        indices
    }

    /// Resolves supervisor-wide settings.
    pub fn supervisor_settings(&self) -> Result<SupervisorSettings, ConfigError> {
        let defaults = SupervisorSettings::default();
        let root = self.project_root();
        let settings = &self.settings;

        let poll_interval =
            parse_optional_duration(settings.poll_interval.as_deref(), defaults.poll_interval)?;
        if poll_interval.is_zero() {
            return Err(ConfigError::invalid(
                "settings",
                "poll_interval must be greater than zero",
            ));
        }

        Ok(SupervisorSettings {
            poll_interval,
            grace_period: parse_optional_duration(
                settings.grace_period.as_deref(),
                defaults.grace_period,
            )?,
            stop_on_dependent_failure: settings.stop_on_dependent_failure,
            log_dir: settings.log_dir.as_deref().map(|dir| resolve_path(&root, dir)),
            state_file: settings
                .state_file
                .as_deref()
                .map(|file| resolve_path(&root, file)),
        })
    }

    /// Resolves every process into a [`ProcessSpec`], sorted by start order.
    pub fn process_specs(&self) -> Result<Vec<ProcessSpec>, ConfigError> {
        if self.processes.is_empty() {
            return Err(ConfigError::invalid(
                "processes",
                "at least one process must be configured",
            ));
        }

        let root = self.project_root();
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.processes.len());

        for (rank, idx) in self.start_order().into_iter().enumerate() {
            let process = &self.processes[idx];
            if !PROCESS_NAME.is_match(&process.name) {
                return Err(ConfigError::invalid(
                    &process.name,
                    "names may only contain letters, digits, '-' and '_'",
                ));
            }
            if !seen.insert(process.name.clone()) {
                return Err(ConfigError::invalid(&process.name, "duplicate process name"));
            }

            let mut spec = process.resolve(&root)?;
            spec.rank = rank;
            specs.push(spec);
        }

        validate_placeholders(&specs)?;
        Ok(specs)
    }
}

impl ProcessConfig {
    fn resolve(&self, root: &Path) -> Result<ProcessSpec, ConfigError> {
        let name = self.name.as_str();
        if self.command.trim().is_empty() {
            return Err(ConfigError::invalid(name, "command must not be empty"));
        }

        let mut spec = ProcessSpec::new(name, self.command.trim());
        spec.args = self.args.clone();
        spec.cwd = match &self.cwd {
            Some(cwd) => resolve_path(root, cwd),
            None => root.to_path_buf(),
        };

        if let Some(env) = &self.env {
            spec.env_file = env.path(root);
            spec.env = env.vars.clone().unwrap_or_default();
        }

        if let Some(readiness) = &self.readiness {
            let (check, retry) = readiness.resolve(name)?;
            spec.readiness = check;
            spec.retry = retry;
        }

        spec.endpoint = match &self.endpoint {
            Some(raw) => Some(
                Endpoint::parse(raw).map_err(|message| ConfigError::invalid(name, message))?,
            ),
            None => Endpoint::from_check(&spec.readiness),
        };

        let mode = match self.restart_policy.as_deref() {
            Some(raw) => RestartMode::from_str(raw.trim()).map_err(|_| {
                ConfigError::invalid(
                    name,
                    format!(
                        "unknown restart_policy '{raw}' (expected never, on-failure or always)"
                    ),
                )
            })?,
            None => RestartMode::Never,
        };
        spec.restart = match mode {
            RestartMode::Never => RestartPolicy::Never,
            RestartMode::OnFailure => RestartPolicy::OnFailure {
                max_attempts: self.max_restarts.unwrap_or(3),
            },
            RestartMode::Always => RestartPolicy::Always,
        };
        spec.restart_backoff = Backoff::new(
            parse_optional_duration(self.backoff.as_deref(), Duration::from_secs(1))?,
            parse_optional_duration(self.max_backoff.as_deref(), Duration::from_secs(30))?,
        );

        Ok(spec)
    }
}

impl ReadinessConfig {
    fn resolve(&self, process: &str) -> Result<(ReadinessCheck, RetryPolicy), ConfigError> {
        let kind = ReadinessKind::from_str(self.kind.trim()).map_err(|_| {
            ConfigError::invalid(
                process,
                format!(
                    "unknown readiness type '{}' (expected tcp, http or delay)",
                    self.kind
                ),
            )
        })?;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            attempt_timeout: parse_optional_duration(
                self.timeout.as_deref(),
                defaults.attempt_timeout,
            )?,
            max_wait: parse_optional_duration(self.max_wait.as_deref(), defaults.max_wait)?,
            backoff: Backoff::new(
                parse_optional_duration(self.backoff.as_deref(), defaults.backoff.initial())?,
                parse_optional_duration(self.max_backoff.as_deref(), defaults.backoff.max())?,
            ),
        };

        let check = match kind {
            ReadinessKind::Tcp => ReadinessCheck::TcpConnect {
                host: self
                    .host
                    .clone()
                    .unwrap_or_else(|| "127.0.0.1".to_string()),
                port: self.port.ok_or_else(|| {
                    ConfigError::invalid(process, "tcp readiness requires a port")
                })?,
            },
            ReadinessKind::Http => {
                let url = self.url.clone().ok_or_else(|| {
                    ConfigError::invalid(process, "http readiness requires a url")
                })?;
                reqwest::Url::parse(&url).map_err(|err| {
                    ConfigError::invalid(process, format!("invalid readiness url '{url}': {err}"))
                })?;
                ReadinessCheck::HttpGet {
                    url,
                    expected_status: self.expected_status.unwrap_or(200),
                }
            }
            ReadinessKind::Delay => ReadinessCheck::FixedDelay(parse_optional_duration(
                self.delay.as_deref(),
                Duration::ZERO,
            )?),
        };

        Ok((check, retry))
    }
}

/// Ensures every placeholder names an earlier process that publishes an endpoint.
fn validate_placeholders(specs: &[ProcessSpec]) -> Result<(), ConfigError> {
    let ranks: HashMap<&str, (usize, bool)> = specs
        .iter()
        .map(|spec| (spec.name.as_str(), (spec.rank, spec.endpoint.is_some())))
        .collect();

    for spec in specs {
        let values = spec.args.iter().chain(spec.env.values());
        for placeholder in values.flat_map(|value| endpoint::placeholders(value)) {
            let raw = &placeholder.raw;
            if placeholder.field.is_none() {
                return Err(ConfigError::invalid(
                    &spec.name,
                    format!("{raw} uses an unknown field (expected host, port, endpoint or url)"),
                ));
            }
            match ranks.get(placeholder.process.as_str()) {
                None => {
                    return Err(ConfigError::invalid(
                        &spec.name,
                        format!("{raw} references an unknown process"),
                    ));
                }
                Some((rank, _)) if *rank >= spec.rank => {
                    return Err(ConfigError::invalid(
                        &spec.name,
                        format!("{raw} references a process that does not start earlier"),
                    ));
                }
                Some((_, false)) => {
                    return Err(ConfigError::invalid(
                        &spec.name,
                        format!(
                            "{raw} references a process without an endpoint; add `endpoint` or a tcp/http readiness check"
                        ),
                    ));
                }
                Some(_) => {}
            }
        }
    }

    Ok(())
}

fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn parse_optional_duration(
    raw: Option<&str>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    raw.map(parse_duration).transpose().map(|d| d.unwrap_or(default))
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
///
/// A bare number is read as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ConfigError::InvalidDuration(raw.to_string()));
    }

    let (amount_str, unit_ms) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1_000)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60_000)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3_600_000)
    } else {
        (value, 1_000)
    };

    let amount: u64 = amount_str
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(raw.to_string()))?;

    Ok(Duration::from_millis(amount.saturating_mul(unit_ms)))
}

/// Expands `${VAR}` references from the supervisor's environment. Bare `$VAR` is left for
/// the child's shell.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing = None;
    let result = ENV_VAR.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(ConfigError::MissingEnvVar(name)),
        None => Ok(result.into_owned()),
    }
}

/// Loads and parses the configuration file, expanding environment variables.
///
/// The returned config has already been resolved once, so callers can rely on
/// [`Config::process_specs`] and [`Config::supervisor_settings`] succeeding.
pub fn load_config(config_path: Option<&str>) -> Result<Config, ConfigError> {
    let config_path = Path::new(config_path.unwrap_or(DEFAULT_CONFIG_FILE));

    let content = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
        path: config_path.to_path_buf(),
        source,
    })?;

    let expanded_content = expand_env_vars(&content)?;
    let mut config: Config = serde_yaml::from_str(&expanded_content)?;

    let base_path = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    config.project_dir = Some(base_path.to_string_lossy().to_string());

    config.process_specs()?;
    config.supervisor_settings()?;
    debug!(
        "Loaded {} process(es) from {}",
        config.processes.len(),
        config_path.display()
    );

    Ok(config)
}
