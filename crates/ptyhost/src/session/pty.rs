//! PTY session management.
//!
//! A session owns one spawned process and the master side of its
//! pseudo-terminal. The handles stay valid while the session is running;
//! once the process exits or the session is released they are dropped and
//! the session never runs again.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use portable_pty::{native_pty_system, Child, CommandBuilder, ExitStatus, MasterPty, PtySize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::output::OutputStream;

/// Unique identifier for a session.
pub type SessionId = String;

/// Fallback shell when neither the caller nor `$SHELL` names one.
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// Terminal width used when the caller does not provide one.
pub const DEFAULT_COLS: u16 = 80;

/// Terminal height used when the caller does not provide one.
pub const DEFAULT_ROWS: u16 = 24;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A live session already uses this id.
    #[error("session already exists: {0}")]
    AlreadyExists(SessionId),

    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session's PTY and process have already been released.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// The OS could not allocate a pseudo-terminal.
    #[error("failed to allocate PTY: {0}")]
    PtyAllocationFailed(String),

    /// The process could not be spawned behind the PTY.
    #[error("failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    /// A terminal mode or size could not be applied.
    #[error("terminal mode error: {0}")]
    TerminalMode(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to terminate the process.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// The registry already holds its maximum number of sessions.
    #[error("session limit reached ({0} live sessions)")]
    SessionLimitReached(usize),

    /// The registry has been shut down and accepts no new sessions.
    #[error("session registry is shut down")]
    RegistryClosed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The process is running.
    Running,
    /// The process terminated on its own with an exit code.
    Exited(i32),
    /// The session was killed externally or by registry shutdown.
    Killed,
}

impl SessionStatus {
    /// Returns true for `Exited` and `Killed`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

/// Parameters for spawning a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    /// Id the session is registered under.
    pub id: SessionId,
    /// Program to run behind the PTY.
    pub shell: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Initial terminal width.
    pub cols: u16,
    /// Initial terminal height.
    pub rows: u16,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory. Defaults to the current directory.
    pub cwd: Option<PathBuf>,
}

impl SessionSpec {
    /// Creates a spec for `shell` with no arguments and the default size.
    pub fn new(id: impl Into<SessionId>, shell: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            shell: shell.into(),
            args: Vec::new(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// When the process was spawned.
    pub start_time: SystemTime,
    /// Whether the process is still running.
    pub running: bool,
    /// Process ID of the child, 0 if unavailable.
    pub pid: u32,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
    /// Lifecycle state.
    pub status: SessionStatus,
}

/// A PTY session with a spawned process.
pub struct Session {
    /// Unique session identifier.
    id: SessionId,

    /// When the process was spawned.
    start_time: SystemTime,

    /// Process ID, if the platform reported one.
    pid: Option<u32>,

    /// The PTY master handle. `None` once released.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,

    /// The writer for the PTY. `None` once released.
    writer: Mutex<Option<Box<dyn Write + Send>>>,

    /// The child process. `None` once released.
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,

    /// Cleared exactly once, when the process exits or is released.
    running: AtomicBool,

    /// Lifecycle state, set once when leaving `Running`.
    status: Mutex<SessionStatus>,

    /// Current terminal size as (cols, rows).
    size: Mutex<(u16, u16)>,

    /// Fired when the session is killed or the registry shuts down.
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Opens a PTY and spawns the process described by `spec`.
    ///
    /// `cancel` becomes the session's cancellation token; the registry passes
    /// a child of its root token.
    pub(crate) fn spawn(
        spec: &SessionSpec,
        cancel: CancellationToken,
    ) -> Result<Self, SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::PtyAllocationFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.shell);
        cmd.args(&spec.args);

        if let Some(dir) = spec.cwd.clone().or_else(|| std::env::current_dir().ok()) {
            cmd.cwd(dir);
        }

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::ProcessSpawnFailed(e.to_string()))?;

        // Only the child may hold the slave side, so EOF reaches our readers
        // when it exits.
        drop(pair.slave);

        let pid = child.process_id();

        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SessionError::PtyAllocationFailed(e.to_string()));
            }
        };

        tracing::debug!(
            session_id = %spec.id,
            shell = %spec.shell,
            pid = ?pid,
            "Spawned PTY process"
        );

        Ok(Session {
            id: spec.id.clone(),
            start_time: SystemTime::now(),
            pid,
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(Some(child)),
            running: AtomicBool::new(true),
            status: Mutex::new(SessionStatus::Running),
            size: Mutex::new((spec.cols, spec.rows)),
            cancel,
        })
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns when the process was spawned.
    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// Returns the process ID of the child, or 0 if unavailable.
    pub fn pid(&self) -> u32 {
        self.pid.unwrap_or(0)
    }

    /// Returns the current terminal size as (cols, rows).
    pub fn size(&self) -> (u16, u16) {
        *lock(&self.size)
    }

    /// Returns the session's cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the lifecycle state without polling the process.
    pub fn status(&self) -> SessionStatus {
        *lock(&self.status)
    }

    /// Returns whether the process has not yet reported an exit status.
    ///
    /// Once this returns false it never returns true again.
    pub fn is_running(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }

        let mut child = lock(&self.child);
        match child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                drop(child);
                self.mark_exited(&status);
                false
            }
            Some(Err(e)) => {
                tracing::warn!(session_id = %self.id, error = %e, "Failed to poll process status");
                true
            }
            None => false,
        }
    }

    /// Polls `is_running` until the process exits and returns the final status.
    ///
    /// A concurrent `release` clears the running flag before it records the
    /// status, so this also waits for the status to leave `Running`.
    pub async fn wait_for_exit(&self, poll_interval: Duration) -> SessionStatus {
        loop {
            if !self.is_running() {
                let status = self.status();
                if status.is_terminal() {
                    return status;
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Writes data to the PTY (the process's stdin).
    pub fn write_input(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::WriteFailed(format!(
                "session {} is no longer running",
                self.id
            )));
        }

        let mut writer = lock(&self.writer);
        let writer = writer.as_mut().ok_or_else(|| {
            SessionError::WriteFailed(format!("PTY for session {} has been released", self.id))
        })?;

        writer
            .write_all(data)
            .and_then(|()| writer.flush())
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    /// Resizes the PTY. Does not affect whether the session is running.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        let master = lock(&self.master);
        let master = master.as_ref().ok_or_else(|| {
            SessionError::TerminalMode(format!("PTY for session {} has been released", self.id))
        })?;

        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::TerminalMode(e.to_string()))?;

        *lock(&self.size) = (cols, rows);

        tracing::debug!(
            session_id = %self.id,
            cols = cols,
            rows = rows,
            "Resized PTY"
        );

        Ok(())
    }

    /// Returns a duplex handle on the PTY master for copy pumps.
    ///
    /// The read half is a cloned descriptor; reads on it end with EOF or an
    /// error once the process exits and the session is released.
    pub fn pty_master(self: &Arc<Self>) -> Result<PtyMaster, SessionError> {
        let master = lock(&self.master);
        let master = master
            .as_ref()
            .ok_or_else(|| SessionError::AlreadyTerminated(self.id.clone()))?;

        let reader = master
            .try_clone_reader()
            .map_err(|e| SessionError::Io(io::Error::other(e.to_string())))?;

        Ok(PtyMaster {
            reader: PtyReader { inner: reader },
            writer: PtyWriter {
                session: Arc::clone(self),
            },
        })
    }

    /// Returns a stream of output chunks produced from now until the PTY
    /// closes. Earlier output is not replayed.
    pub fn output_stream(self: &Arc<Self>) -> Result<OutputStream, SessionError> {
        let (reader, _) = self.pty_master()?.split();
        OutputStream::spawn(self.id.clone(), reader)
    }

    /// Returns a typed snapshot of the session.
    pub fn info(&self) -> SessionInfo {
        let running = self.is_running();
        let (cols, rows) = self.size();

        SessionInfo {
            id: self.id.clone(),
            start_time: self.start_time,
            running,
            pid: self.pid(),
            cols,
            rows,
            status: self.status(),
        }
    }

    /// Releases the PTY and the process.
    ///
    /// Cancels the session token, force-kills the process if it is still
    /// alive and drops the PTY handles. Calling this again is a no-op.
    pub(crate) fn release(&self) -> Result<(), SessionError> {
        self.cancel.cancel();
        self.running.store(false, Ordering::SeqCst);

        let mut result = Ok(());
        let child = lock(&self.child).take();

        if let Some(mut child) = child {
            match child.try_wait() {
                Ok(Some(status)) => self.mark_exited(&status),
                _ => match child.kill() {
                    Ok(()) => {
                        if let Err(e) = child.wait() {
                            tracing::debug!(
                                session_id = %self.id,
                                error = %e,
                                "Failed to reap process"
                            );
                        }
                        self.mark_status(SessionStatus::Killed);
                    }
                    Err(e) => match child.try_wait() {
                        Ok(Some(status)) => self.mark_exited(&status),
                        _ => {
                            self.mark_status(SessionStatus::Killed);
                            result = Err(SessionError::KillFailed(e.to_string()));
                        }
                    },
                },
            }
        }

        drop(lock(&self.writer).take());
        drop(lock(&self.master).take());

        result
    }

    fn mark_exited(&self, status: &ExitStatus) {
        self.mark_status(exit_status(status));
    }

    fn mark_status(&self, status: SessionStatus) {
        self.running.store(false, Ordering::SeqCst);
        let mut current = lock(&self.status);
        if *current == SessionStatus::Running {
            *current = status;
            tracing::info!(session_id = %self.id, status = ?status, "Session ended");
        }
    }
}

/// Maps a child's exit status onto a session status.
///
/// `ExitStatus` does not expose the terminating signal directly; it only
/// shows up in the display form.
fn exit_status(status: &ExitStatus) -> SessionStatus {
    if !status.success() && status.to_string().starts_with("Terminated by") {
        return SessionStatus::Killed;
    }
    SessionStatus::Exited(i32::try_from(status.exit_code()).unwrap_or(i32::MAX))
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to release session on drop");
        }
    }
}

/// Duplex handle on a session's PTY master.
pub struct PtyMaster {
    reader: PtyReader,
    writer: PtyWriter,
}

impl PtyMaster {
    /// Splits the handle into independently owned halves.
    pub fn split(self) -> (PtyReader, PtyWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of a [`PtyMaster`]: the process's output.
pub struct PtyReader {
    inner: Box<dyn Read + Send>,
}

impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Write half of a [`PtyMaster`]: the process's input.
///
/// Writes go through [`Session::write_input`] and fail once the session
/// has been released.
pub struct PtyWriter {
    session: Arc<Session>,
}

impl Write for PtyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.session
            .write_input(buf)
            .map(|()| buf.len())
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if Some
/// 2. The $SHELL environment variable
/// 3. /bin/sh as fallback
pub fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell.filter(|s| !s.is_empty()) {
        return s;
    }

    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
