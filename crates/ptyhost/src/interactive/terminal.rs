//! Access to the operator's real terminal.
//!
//! The runner only talks to the terminal through [`TerminalHost`], so tests
//! can drive it with in-memory input and output.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};

/// The terminal an interactive session is bound to.
pub trait TerminalHost: Send + Sync {
    /// Saves the current mode and switches to raw mode.
    fn enter_raw_mode(&self) -> io::Result<()>;

    /// Restores the mode saved by `enter_raw_mode`.
    ///
    /// Must be a no-op when raw mode is not active.
    fn restore(&self) -> io::Result<()>;

    /// Returns the current size as (cols, rows).
    fn size(&self) -> io::Result<(u16, u16)>;

    /// Returns a reader for operator input.
    fn input(&self) -> Box<dyn Read + Send>;

    /// Returns a writer for session output.
    fn output(&self) -> Box<dyn Write + Send>;
}

/// The process's controlling terminal, driven through crossterm.
///
/// crossterm keeps the original termios when entering raw mode and puts it
/// back on `disable_raw_mode`.
#[derive(Debug, Default)]
pub struct CrosstermTerminal {
    raw: AtomicBool,
}

impl CrosstermTerminal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether this handle currently holds the terminal in raw mode.
    pub fn is_raw(&self) -> bool {
        self.raw.load(Ordering::SeqCst)
    }
}

impl TerminalHost for CrosstermTerminal {
    fn enter_raw_mode(&self) -> io::Result<()> {
        enable_raw_mode()?;
        self.raw.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn restore(&self) -> io::Result<()> {
        if self.raw.swap(false, Ordering::SeqCst) {
            disable_raw_mode()?;
        }
        Ok(())
    }

    fn size(&self) -> io::Result<(u16, u16)> {
        size()
    }

    fn input(&self) -> Box<dyn Read + Send> {
        Box::new(io::stdin())
    }

    fn output(&self) -> Box<dyn Write + Send> {
        Box::new(io::stdout())
    }
}

impl Drop for CrosstermTerminal {
    fn drop(&mut self) {
        // Best effort cleanup
        let _ = self.restore();
    }
}
