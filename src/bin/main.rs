use std::{path::PathBuf, process::ExitCode};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tether::{
    cli::{Cli, Commands, parse_args},
    config::load_config,
    error::{StatusError, SupervisorError},
    logs::tail_log,
    shutdown::install_signal_handler,
    status::StateSnapshot,
    supervisor::Supervisor,
};

/// Exit code for `status` and `logs` failures.
const EXIT_QUERY_FAILED: u8 = 1;

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::Start { config } => match start(&config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("{err}");
                ExitCode::from(err.exit_code())
            }
        },
        Commands::Check { config } => match check(&config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("{err}");
                ExitCode::from(err.exit_code())
            }
        },
        Commands::Status {
            config,
            state,
            json,
            no_color,
        } => match status(&config, state, json, no_color) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("{err}");
                ExitCode::from(EXIT_QUERY_FAILED)
            }
        },
        Commands::Logs {
            config,
            process,
            lines,
            kind,
        } => {
            let result = load_config(Some(&config))
                .map_err(|err| err.to_string())
                .and_then(|cfg| {
                    cfg.supervisor_settings()
                        .map_err(|err| err.to_string())?
                        .log_dir
                        .ok_or_else(|| format!("settings.log_dir is not set in {config}"))
                })
                .and_then(|dir| {
                    tail_log(&dir, &process, kind.as_str(), lines).map_err(|err| {
                        format!("No {kind} log for '{process}' in {}: {err}", dir.display())
                    })
                });
            match result {
                Ok(lines) => {
                    for line in lines {
                        println!("{line}");
                    }
                    ExitCode::SUCCESS
                }
                Err(message) => {
                    eprintln!("{message}");
                    ExitCode::from(EXIT_QUERY_FAILED)
                }
            }
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn start(config_path: &str) -> Result<(), SupervisorError> {
    let config = load_config(Some(config_path))?;
    let mut supervisor = Supervisor::new(&config)?;
    install_signal_handler(supervisor.shutdown_token())?;

    info!("Starting tether with config {config_path}");
    supervisor.run()?;
    info!("tether shut down cleanly");
    Ok(())
}

fn check(config_path: &str) -> Result<(), SupervisorError> {
    let config = load_config(Some(config_path))?;
    let specs = config.process_specs()?;

    println!("{config_path}: OK, {} process(es) in start order:", specs.len());
    for spec in &specs {
        let endpoint = spec
            .endpoint
            .as_ref()
            .map(|endpoint| format!(", publishes {endpoint}"))
            .unwrap_or_default();
        println!(
            "  {}. {} (ready on {}{endpoint})",
            spec.rank + 1,
            spec.name,
            spec.readiness.describe()
        );
    }
    Ok(())
}

fn status(
    config_path: &str,
    state: Option<String>,
    json: bool,
    no_color: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = match state {
        Some(path) => PathBuf::from(path),
        None => load_config(Some(config_path))?
            .supervisor_settings()?
            .state_file
            .ok_or_else(|| {
                format!("settings.state_file is not set in {config_path}; pass --state")
            })?,
    };

    let snapshot = match StateSnapshot::load(&path) {
        Ok(snapshot) => snapshot,
        Err(StatusError::NotFound(path)) => {
            return Err(format!(
                "No state file at {}; is tether running with settings.state_file?",
                path.display()
            )
            .into());
        }
        Err(err) => return Err(err.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", snapshot.render_table(!no_color));
    }
    Ok(())
}
