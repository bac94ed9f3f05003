//! Launching managed processes.
use std::{
    collections::HashMap,
    fs, io,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};

use tracing::{debug, error, warn};

use crate::{
    endpoint::{self, Endpoint},
    logs::spawn_log_writer,
    process::ProcessSpec,
};

/// Concrete command line for one run of a process, with placeholders already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
}

/// Build the environment map for a process, giving inline `env` entries precedence over
/// entries loaded from the env file.
pub fn collect_process_env(spec: &ProcessSpec) -> HashMap<String, String> {
    let mut resolved = HashMap::new();

    if let Some(file_path) = &spec.env_file {
        match fs::read_to_string(file_path) {
            Ok(content) => {
                for raw_line in content.lines() {
                    let line = raw_line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let line = line.strip_prefix("export ").unwrap_or(line);

                    if let Some((key, value)) = line.split_once('=') {
                        let key = key.trim().to_string();
                        let mut value = value.trim();

                        if value.len() >= 2
                            && ((value.starts_with('"') && value.ends_with('"'))
                                || (value.starts_with('\'') && value.ends_with('\'')))
                        {
                            value = &value[1..value.len() - 1];
                        }

                        resolved.entry(key).or_insert_with(|| value.to_string());
                    } else {
                        warn!(
                            "Ignoring malformed line in env file for '{}': {}",
                            spec.name, line
                        );
                    }
                }
            }
            Err(err) => {
                error!(
                    "Failed to read env file {} for '{}': {}",
                    file_path.display(),
                    spec.name,
                    err
                );
            }
        }
    }

    for (key, value) in &spec.env {
        resolved.insert(key.clone(), value.clone());
    }

    resolved
}

/// Resolves placeholders in arguments and environment against the endpoints published so far.
///
/// Fails with the first placeholder that has no published endpoint.
pub fn prepare(
    spec: &ProcessSpec,
    endpoints: &HashMap<String, Endpoint>,
) -> Result<Invocation, String> {
    let args = spec
        .args
        .iter()
        .map(|arg| endpoint::substitute(arg, endpoints))
        .collect::<Result<Vec<_>, _>>()?;

    let env = collect_process_env(spec)
        .into_iter()
        .map(|(key, value)| endpoint::substitute(&value, endpoints).map(|value| (key, value)))
        .collect::<Result<HashMap<_, _>, _>>()?;

    Ok(Invocation {
        program: resolve_program(&spec.command, &spec.cwd),
        args,
        env,
        cwd: spec.cwd.clone(),
    })
}

/// Relative paths such as `.venv/bin/uvicorn` resolve against the working directory; bare
/// names are left for `PATH` lookup.
fn resolve_program(command: &str, cwd: &Path) -> PathBuf {
    let path = Path::new(command);
    if path.is_relative() && command.contains('/') {
        cwd.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Spawns the process in its own process group with piped output.
///
/// On **Linux**, the child also receives `SIGTERM` if the supervisor dies, via `prctl()`.
pub fn launch(
    name: &str,
    invocation: &Invocation,
    log_dir: Option<&Path>,
) -> io::Result<Child> {
    if !invocation.cwd.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!(
                "working directory {} does not exist",
                invocation.cwd.display()
            ),
        ));
    }

    debug!(
        "Launching process '{name}': {} {:?}",
        invocation.program.display(),
        invocation.args
    );

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .current_dir(&invocation.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if !invocation.env.is_empty() {
        let mut keys: Vec<_> = invocation.env.keys().collect();
        keys.sort();
        debug!("Setting environment variables for '{name}': {keys:?}");
        cmd.envs(&invocation.env);
    }

    unsafe {
        cmd.pre_exec(|| {
            // Own process group, so the whole tree can be signalled without touching ours.
            if libc::setpgid(0, 0) < 0 {
                return Err(io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            {
                use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    let mut child = cmd.spawn().inspect_err(|err| {
        error!("Failed to start process '{name}': {err}");
    })?;
    debug!("Process '{name}' started with PID: {}", child.id());

    let log_dir = log_dir.map(Path::to_path_buf);
    if let Some(out) = child.stdout.take() {
        spawn_log_writer(name, out, "stdout", log_dir.clone());
    }
    if let Some(err) = child.stderr.take() {
        spawn_log_writer(name, err, "stderr", log_dir);
    }

    Ok(child)
}
