//! Readiness checks: deciding when a freshly spawned process can serve.
//!
//! `TcpConnect` and `HttpGet` actively probe the process and detect a process that never
//! starts serving. `FixedDelay` only waits out a wall-clock interval and accepts the process
//! unconditionally afterwards; it exists as a fallback for processes without a probe-able
//! endpoint.
use std::{
    io,
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    ops::ControlFlow,
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use reqwest::blocking::Client;
use thiserror::Error;
use tracing::debug;

use crate::backoff::Backoff;

/// Smallest timeout handed to a single probe attempt.
const MIN_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(10);

/// How often the pause hook runs while an attempt is in flight.
const ATTEMPT_SLICE: Duration = Duration::from_millis(10);

/// How the supervisor decides that a process is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessCheck {
    /// Ready once a TCP connection to `host:port` succeeds.
    TcpConnect { host: String, port: u16 },
    /// Ready once `GET url` answers with `expected_status`.
    HttpGet { url: String, expected_status: u16 },
    /// Ready after the given delay. Cannot detect a process that is not serving.
    FixedDelay(Duration),
}

impl ReadinessCheck {
    /// Short human-readable description used in logs.
    pub fn describe(&self) -> String {
        match self {
            ReadinessCheck::TcpConnect { host, port } => format!("tcp {host}:{port}"),
            ReadinessCheck::HttpGet {
                url,
                expected_status,
            } => format!("http GET {url} -> {expected_status}"),
            ReadinessCheck::FixedDelay(delay) => format!("fixed delay {delay:?}"),
        }
    }
}

/// Retry bounds applied to probing checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Upper bound for a single probe attempt.
    pub attempt_timeout: Duration,
    /// Upper bound for the whole readiness wait.
    pub max_wait: Duration,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
            backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(2)),
        }
    }
}

/// Errors from individual probe attempts.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to resolve {target}: {source}")]
    Resolve {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("{target} did not resolve to any address")]
    NoAddress { target: String },
    #[error("connection to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {actual}, expected {expected}")]
    UnexpectedStatus {
        url: String,
        expected: u16,
        actual: u16,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("probe attempt for {target} ended without a result")]
    Lost { target: String },
}

/// Result of waiting for a process to become ready.
#[derive(Debug)]
pub enum WaitOutcome<B> {
    /// The check passed.
    Ready { attempts: u32, waited: Duration },
    /// `max_wait` elapsed without a passing probe.
    TimedOut {
        attempts: u32,
        waited: Duration,
        last_error: Option<ProbeError>,
    },
    /// The caller's pause hook asked to stop waiting.
    Interrupted(B),
}

/// Runs single probe attempts for one check.
#[derive(Clone)]
pub struct Prober {
    check: ReadinessCheck,
    client: Option<Client>,
}

impl Prober {
    /// Prepares a prober; HTTP checks get a dedicated blocking client.
    pub fn new(check: &ReadinessCheck) -> Result<Self, ProbeError> {
        let client = match check {
            ReadinessCheck::HttpGet { .. } => Some(
                Client::builder()
                    .redirect(reqwest::redirect::Policy::none())
                    .build()
                    .map_err(ProbeError::Client)?,
            ),
            _ => None,
        };

        Ok(Self {
            check: check.clone(),
            client,
        })
    }

    /// Performs one attempt bounded by `timeout`. Fixed delays always pass.
    pub fn probe(&self, timeout: Duration) -> Result<(), ProbeError> {
        let timeout = timeout.max(MIN_ATTEMPT_TIMEOUT);
        match (&self.check, &self.client) {
            (ReadinessCheck::TcpConnect { host, port }, _) => {
                probe_tcp(host, *port, timeout)
            }
            (
                ReadinessCheck::HttpGet {
                    url,
                    expected_status,
                },
                Some(client),
            ) => probe_http(client, url, *expected_status, timeout),
            (ReadinessCheck::HttpGet { .. }, None) => Ok(()),
            (ReadinessCheck::FixedDelay(_), _) => Ok(()),
        }
    }
}

/// Tries every resolved address; together they share one `timeout`.
fn probe_tcp(host: &str, port: u16, timeout: Duration) -> Result<(), ProbeError> {
    let deadline = Instant::now() + timeout;
    let target = format!("{host}:{port}");
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| ProbeError::Resolve {
            target: target.clone(),
            source,
        })?
        .collect();

    let mut last_err = None;
    for (tried, addr) in addrs.iter().enumerate() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            last_err.get_or_insert_with(|| io::Error::from(io::ErrorKind::TimedOut));
            break;
        }
        let share = (remaining / (addrs.len() - tried) as u32).max(MIN_ATTEMPT_TIMEOUT);
        match TcpStream::connect_timeout(addr, share) {
            Ok(_) => return Ok(()),
            Err(err) => last_err = Some(err),
        }
    }

    match last_err {
        Some(source) => Err(ProbeError::Connect { target, source }),
        None => Err(ProbeError::NoAddress { target }),
    }
}

fn probe_http(
    client: &Client,
    url: &str,
    expected: u16,
    timeout: Duration,
) -> Result<(), ProbeError> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .map_err(|source| ProbeError::Request {
            url: url.to_string(),
            source,
        })?;

    let actual = response.status().as_u16();
    if actual == expected {
        Ok(())
    } else {
        Err(ProbeError::UnexpectedStatus {
            url: url.to_string(),
            expected,
            actual,
        })
    }
}

/// Runs one attempt on a helper thread, calling `pause(Duration::ZERO)` every
/// [`ATTEMPT_SLICE`] until it reports back.
///
/// An interrupted attempt is abandoned; its thread ends on its own once `timeout` runs out.
fn attempt<B>(
    prober: &Prober,
    timeout: Duration,
    pause: &mut impl FnMut(Duration) -> ControlFlow<B>,
) -> ControlFlow<B, Result<(), ProbeError>> {
    let (tx, rx) = mpsc::channel();
    let worker = prober.clone();
    thread::spawn(move || {
        let _ = tx.send(worker.probe(timeout));
    });

    loop {
        match rx.recv_timeout(ATTEMPT_SLICE) {
            Ok(result) => return ControlFlow::Continue(result),
            Err(RecvTimeoutError::Disconnected) => {
                return ControlFlow::Continue(Err(ProbeError::Lost {
                    target: prober.check.describe(),
                }));
            }
            Err(RecvTimeoutError::Timeout) => pause(Duration::ZERO)?,
        }
    }
}

/// Blocks until `check` passes, `policy.max_wait` elapses, or `pause` breaks.
///
/// All waiting goes through `pause`, which receives the delay to wait before the next attempt
/// (zero before the first one). Attempts run off the calling thread, and `pause` is also called
/// with a zero delay while one is in flight. Returning [`ControlFlow::Break`] from it aborts the
/// wait with [`WaitOutcome::Interrupted`]. The supervisor uses the hook to keep draining liveness
/// events and to observe shutdown requests while a process is being probed.
pub fn wait_until_ready<B>(
    check: &ReadinessCheck,
    policy: &RetryPolicy,
    mut pause: impl FnMut(Duration) -> ControlFlow<B>,
) -> Result<WaitOutcome<B>, ProbeError> {
    let started = Instant::now();

    if let ReadinessCheck::FixedDelay(delay) = check {
        if let ControlFlow::Break(reason) = pause(*delay) {
            return Ok(WaitOutcome::Interrupted(reason));
        }
        return Ok(WaitOutcome::Ready {
            attempts: 0,
            waited: started.elapsed(),
        });
    }

    let prober = Prober::new(check)?;
    let mut backoff = policy.backoff;
    backoff.reset();

    let mut attempts = 0;
    let mut delay = Duration::ZERO;
    let mut last_error = None;

    loop {
        if let ControlFlow::Break(reason) = pause(delay) {
            return Ok(WaitOutcome::Interrupted(reason));
        }

        let remaining = policy.max_wait.saturating_sub(started.elapsed());
        attempts += 1;
        let result = match attempt(&prober, policy.attempt_timeout.min(remaining), &mut pause) {
            ControlFlow::Continue(result) => result,
            ControlFlow::Break(reason) => return Ok(WaitOutcome::Interrupted(reason)),
        };
        match result {
            Ok(()) => {
                return Ok(WaitOutcome::Ready {
                    attempts,
                    waited: started.elapsed(),
                });
            }
            Err(err) => {
                debug!("Readiness attempt {attempts} ({}) failed: {err}", check.describe());
                last_error = Some(err);
            }
        }

        let remaining = policy.max_wait.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Ok(WaitOutcome::TimedOut {
                attempts,
                waited: started.elapsed(),
                last_error,
            });
        }

        delay = backoff.next_delay().min(remaining);
    }
}
