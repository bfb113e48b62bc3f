//! Interactive sessions bound to the operator's terminal.
//!
//! - [`terminal`]: raw mode and size of the real terminal
//! - [`signals`]: SIGINT/SIGTERM and window size notifications
//! - [`cleanup`]: exactly-once teardown of a run
//! - [`feeder`]: scripted command injection
//! - [`runner`]: the foreground run loop tying it all together

pub mod cleanup;
pub mod feeder;
pub mod runner;
pub mod signals;
pub mod terminal;

#[cfg(test)]
mod testing;

pub use cleanup::Cleanup;
pub use feeder::{CommandFeeder, DEFAULT_COMMAND_DELAY, DEFAULT_SETTLE_DELAY};
pub use runner::{
    ExitHook, InteractiveRunner, InteractiveSpec, RunnerOptions, DEFAULT_POLL_INTERVAL,
};
pub use signals::{ShutdownSignals, WindowSizeSignals};
pub use terminal::{CrosstermTerminal, TerminalHost};
