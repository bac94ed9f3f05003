//! Capture of child stdout/stderr.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
};

use tracing::{info, warn};

/// Log target used for forwarded child output.
pub const CHILD_TARGET: &str = "tether::child";

/// Path of the log file for one stream of a process, e.g. `<dir>/server.stdout.log`.
pub fn resolve_log_path(log_dir: &Path, process: &str, kind: &str) -> PathBuf {
    log_dir.join(format!("{process}.{kind}.log"))
}

fn open_log_file(log_dir: &Path, process: &str, kind: &str) -> io::Result<File> {
    fs::create_dir_all(log_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(resolve_log_path(log_dir, process, kind))
}

/// Forwards every line from `stream` to the tracing output and, when `log_dir` is set, appends
/// it to the process log file. The thread ends when the child closes the stream.
pub fn spawn_log_writer<R>(
    process: &str,
    stream: R,
    kind: &'static str,
    log_dir: Option<PathBuf>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    let process = process.to_string();
    thread::spawn(move || {
        let mut file = log_dir.as_deref().and_then(|dir| {
            open_log_file(dir, &process, kind)
                .inspect_err(|err| {
                    warn!("Failed to open {kind} log for '{process}': {err}");
                })
                .ok()
        });

        let reader = BufReader::new(stream);
        for line in reader.lines().map_while(Result::ok) {
            info!(target: CHILD_TARGET, "[{process}:{kind}] {line}");
            if let Some(out) = file.as_mut()
                && let Err(err) = writeln!(out, "{line}")
            {
                warn!("Failed to write {kind} log for '{process}': {err}");
                file = None;
            }
        }
    })
}

/// Reads the last `lines` lines of a process log.
pub fn tail_log(log_dir: &Path, process: &str, kind: &str, lines: usize) -> io::Result<Vec<String>> {
    let file = File::open(resolve_log_path(log_dir, process, kind))?;
    let all_lines: Vec<String> = BufReader::new(file).lines().map_while(Result::ok).collect();
    let start = all_lines.len().saturating_sub(lines);
    Ok(all_lines[start..].to_vec())
}
