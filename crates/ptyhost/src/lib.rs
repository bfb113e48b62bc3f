//! # ptyhost
//!
//! Local pseudo-terminal session management with an interactive runner.
//!
//! ## Overview
//!
//! - **Session Registry**: Create, resize, write to, stream from and kill
//!   PTY-backed shell sessions, each identified by a unique id. Sessions
//!   whose process exits on its own are reaped automatically.
//! - **Interactive Runner**: Bind one session to the current terminal in raw
//!   mode, forward input and output, follow window resizes, type a scripted
//!   list of commands, and restore the terminal exactly once on every exit
//!   path.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ptyhost::{Config, InteractiveRunner, InteractiveSpec, SessionRegistry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let registry = Arc::new(SessionRegistry::with_options(config.registry_options()));
//!
//!     let runner = InteractiveRunner::new(Arc::clone(&registry), config.runner_options());
//!     let spec = InteractiveSpec::new("demo", vec!["ls -la".to_string()]);
//!     let status = runner.run(spec).await?;
//!     println!("session finished: {status:?}");
//!
//!     registry.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY sessions and the session registry
//! - [`interactive`]: Foreground runs bound to the terminal

pub mod config;
pub mod interactive;
pub mod session;

// Re-export config types for convenience
pub use config::{Config, ConfigError, Profile};

// Re-export session types for convenience
pub use session::{
    OutputStream, RegistryOptions, Session, SessionError, SessionId, SessionInfo, SessionRegistry,
    SessionSpec, SessionStatus,
};

// Re-export interactive types for convenience
pub use interactive::{
    CrosstermTerminal, InteractiveRunner, InteractiveSpec, RunnerOptions, TerminalHost,
};
