//! Scripted command injection.
//!
//! The feeder has no readiness handshake with the shell: it waits a fixed
//! settle delay for the prompt to appear, then types each command followed
//! by a newline with a short pause in between. Nothing acknowledges that a
//! command was read, so slow shells may still see input before their prompt.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::session::{Session, SessionError};

/// Default wait before the first command.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Default pause between commands.
pub const DEFAULT_COMMAND_DELAY: Duration = Duration::from_millis(100);

/// Writes an ordered list of commands into a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFeeder {
    settle_delay: Duration,
    command_delay: Duration,
}

impl Default for CommandFeeder {
    fn default() -> Self {
        Self::new(DEFAULT_SETTLE_DELAY, DEFAULT_COMMAND_DELAY)
    }
}

impl CommandFeeder {
    pub fn new(settle_delay: Duration, command_delay: Duration) -> Self {
        Self {
            settle_delay,
            command_delay,
        }
    }

    /// Feeds `commands` into `session` and returns how many were written.
    ///
    /// Stops at the first failed write, which normally means the shell has
    /// already exited.
    pub async fn feed(&self, session: Arc<Session>, commands: Vec<String>) -> usize {
        if commands.is_empty() {
            return 0;
        }

        tokio::time::sleep(self.settle_delay).await;

        let total = commands.len();
        let mut written = 0;

        for (index, command) in commands.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.command_delay).await;
            }

            match write_line(&session, command).await {
                Ok(()) => written += 1,
                Err(e) => {
                    tracing::warn!(
                        session_id = %session.id(),
                        error = %e,
                        remaining = total - written,
                        "Stopped feeding commands"
                    );
                    break;
                }
            }
        }

        tracing::debug!(session_id = %session.id(), written, total, "Finished feeding commands");
        written
    }

    /// Runs [`CommandFeeder::feed`] as a background task.
    pub fn spawn(self, session: Arc<Session>, commands: Vec<String>) -> JoinHandle<usize> {
        tokio::spawn(async move { self.feed(session, commands).await })
    }
}

async fn write_line(session: &Arc<Session>, command: String) -> Result<(), SessionError> {
    let session = Arc::clone(session);
    tokio::task::spawn_blocking(move || {
        let mut line = command.into_bytes();
        line.push(b'\n');
        session.write_input(&line)
    })
    .await
    .map_err(|e| SessionError::WriteFailed(format!("write task failed: {e}")))?
}
