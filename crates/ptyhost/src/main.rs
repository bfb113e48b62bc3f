//! ptyhost
//!
//! Runs scripted shell sessions in a pseudo-terminal bound to the current
//! terminal.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{Parser, Subcommand};
use ptyhost::config::{default_config_path, Config};
use ptyhost::interactive::{InteractiveRunner, InteractiveSpec};
use ptyhost::session::{SessionRegistry, SessionStatus};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Name of the log file written during interactive runs.
const LOG_FILE_NAME: &str = "ptyhost.log";

/// ptyhost - scripted shell sessions in a pseudo-terminal.
#[derive(Parser, Debug)]
#[command(name = "ptyhost")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a profile or ad hoc commands in an interactive shell
    Run {
        /// Profile to run, as named in the configuration file
        #[arg(required_unless_present = "commands", conflicts_with = "commands")]
        profile: Option<String>,

        /// Command to type into the shell (repeatable)
        #[arg(long = "command", value_name = "CMD")]
        commands: Vec<String>,

        /// Shell to run instead of the configured one
        #[arg(long)]
        shell: Option<String>,
    },

    /// List configured profiles
    Profiles {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration
    Config {
        /// Print only the configuration file path
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    let overrides = config.apply_env_overrides();
    config.validate()?;

    match cli.command {
        Commands::Run {
            profile,
            commands,
            shell,
        } => {
            // The terminal belongs to the session while it runs.
            let log_guard = LogGuard::new(init_file_logging(&config, cli.verbose)?);
            log_startup(&config_path, &overrides);

            let exit_hook = move |code: i32| {
                log_guard.flush();
                std::process::exit(code);
            };
            run_interactive(&config, profile, commands, shell, exit_hook).await
        }
        Commands::Profiles { json } => {
            init_stderr_logging(&config, cli.verbose);
            log_startup(&config_path, &overrides);

            if json {
                println!("{}", serde_json::to_string_pretty(&config.profiles)?);
            } else if config.profiles.is_empty() {
                println!("No profiles configured in {}", config_path.display());
            } else {
                for (name, profile) in &config.profiles {
                    let noun = if profile.commands.len() == 1 {
                        "command"
                    } else {
                        "commands"
                    };
                    println!("{:<20} {} {}", name, profile.commands.len(), noun);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config { path } => {
            init_stderr_logging(&config, cli.verbose);
            log_startup(&config_path, &overrides);

            if path {
                println!("{}", config_path.display());
            } else {
                print!("{}", config.to_toml()?);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Reports what was loaded once a subscriber is installed.
fn log_startup(config_path: &Path, overrides: &[&str]) {
    if config_path.exists() {
        tracing::info!(config = %config_path.display(), "ptyhost starting");
    } else {
        tracing::info!(
            config = %config_path.display(),
            "ptyhost starting, config file not found, using defaults"
        );
    }
    for variable in overrides {
        tracing::info!(variable, "Applied environment override");
    }
}

/// Runs one interactive session and maps its outcome to an exit code.
///
/// `exit_hook` ends the process after a termination signal has been handled.
async fn run_interactive(
    config: &Config,
    profile: Option<String>,
    commands: Vec<String>,
    shell: Option<String>,
    exit_hook: impl Fn(i32) + Send + Sync + 'static,
) -> anyhow::Result<ExitCode> {
    let mut spec = match profile {
        Some(name) => config
            .profile(&name)
            .with_context(|| format!("Unknown profile: {name}"))?
            .interactive_spec(session_id(&name)),
        None => InteractiveSpec::new(session_id("adhoc"), commands),
    };
    if shell.is_some() {
        spec.shell = shell;
    }

    let registry = Arc::new(SessionRegistry::with_options(config.registry_options()));
    let runner = InteractiveRunner::new(Arc::clone(&registry), config.runner_options())
        .with_exit_hook(exit_hook);

    let result = runner.run(spec).await;
    registry.shutdown().await?;

    let status = result.context("Interactive session failed")?;
    Ok(exit_code(status))
}

/// Builds a unique session id prefixed with `prefix`.
fn session_id(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &suffix[..8])
}

/// Exit code of `ptyhost run` for a finished session.
fn exit_code(status: SessionStatus) -> ExitCode {
    match status {
        SessionStatus::Exited(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        SessionStatus::Killed | SessionStatus::Running => ExitCode::FAILURE,
    }
}

/// Holds the file writer's guard so an exit that skips destructors can still
/// flush buffered log lines.
#[derive(Clone)]
struct LogGuard(Arc<Mutex<Option<WorkerGuard>>>);

impl LogGuard {
    fn new(guard: WorkerGuard) -> Self {
        Self(Arc::new(Mutex::new(Some(guard))))
    }

    /// Flushes pending lines and stops the writer. Later calls are no-ops.
    fn flush(&self) {
        let guard = match self.0.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(guard);
    }
}

fn env_filter(config: &Config, verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
}

fn init_stderr_logging(config: &Config, verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config, verbose))
        .with_writer(std::io::stderr)
        .init();
}

/// Sends logs to `logging.log_dir` so they never interleave with session
/// output. The returned guard flushes pending lines when dropped.
fn init_file_logging(config: &Config, verbose: bool) -> anyhow::Result<WorkerGuard> {
    let log_dir: &Path = &config.logging.log_dir;
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let appender = tracing_appender::rolling::never(log_dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config, verbose))
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_profile() {
        let cli = Cli::try_parse_from(["ptyhost", "run", "build"]).unwrap();
        match cli.command {
            Commands::Run {
                profile,
                commands,
                shell,
            } => {
                assert_eq!(profile.as_deref(), Some("build"));
                assert!(commands.is_empty());
                assert!(shell.is_none());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_commands() {
        let cli = Cli::try_parse_from([
            "ptyhost",
            "run",
            "--command",
            "ls -la",
            "--command",
            "exit",
            "--shell",
            "/bin/sh",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                profile,
                commands,
                shell,
            } => {
                assert!(profile.is_none());
                assert_eq!(commands, vec!["ls -la", "exit"]);
                assert_eq!(shell.as_deref(), Some("/bin/sh"));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_requires_profile_or_commands() {
        assert!(Cli::try_parse_from(["ptyhost", "run"]).is_err());
    }

    #[test]
    fn test_run_profile_conflicts_with_commands() {
        let result = Cli::try_parse_from(["ptyhost", "run", "build", "--command", "ls"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_profiles_json() {
        let cli = Cli::try_parse_from(["ptyhost", "profiles", "--json"]).unwrap();
        match cli.command {
            Commands::Profiles { json } => assert!(json),
            _ => panic!("Expected Profiles command"),
        }
    }

    #[test]
    fn test_config_path() {
        let cli = Cli::try_parse_from(["ptyhost", "config", "--path"]).unwrap();
        match cli.command {
            Commands::Config { path } => assert!(path),
            _ => panic!("Expected Config command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["ptyhost", "profiles", "--config", "/tmp/c.toml", "-v"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(cli.verbose);
    }

    #[test]
    fn test_session_id_unique() {
        let a = session_id("build");
        let b = session_id("build");

        assert!(a.starts_with("build-"));
        assert_eq!(a.len(), "build-".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_log_guard_flush_writes_pending_lines() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let appender = tracing_appender::rolling::never(dir.path(), LOG_FILE_NAME);
        let (mut writer, guard) = tracing_appender::non_blocking(appender);
        let log_guard = LogGuard::new(guard);

        writer.write_all(b"line before exit\n").unwrap();
        log_guard.clone().flush();
        log_guard.flush();

        let written = std::fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        assert_eq!(written, "line before exit\n");
        assert!(log_guard.0.lock().unwrap().is_none());
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(exit_code(SessionStatus::Exited(0)), ExitCode::SUCCESS);
        assert_eq!(exit_code(SessionStatus::Exited(3)), ExitCode::from(3));
        assert_eq!(exit_code(SessionStatus::Exited(-1)), ExitCode::from(1));
        assert_eq!(exit_code(SessionStatus::Killed), ExitCode::FAILURE);
    }
}
