//! Unix signal listeners used while a session is bound to the terminal.

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};

/// Listens for SIGINT and SIGTERM.
///
/// Registration happens in [`ShutdownSignals::register`], so a failure is
/// visible before anything is spawned.
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    pub fn register() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Waits for the next signal and returns its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

/// Listens for SIGWINCH.
pub struct WindowSizeSignals {
    window_change: Signal,
}

impl WindowSizeSignals {
    pub fn register() -> io::Result<Self> {
        Ok(Self {
            window_change: signal(SignalKind::window_change())?,
        })
    }

    /// Waits for the next window-size change. Returns false if the signal
    /// stream has closed.
    pub async fn recv(&mut self) -> bool {
        self.window_change.recv().await.is_some()
    }
}
