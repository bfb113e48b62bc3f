//! Foreground interactive sessions.
//!
//! [`InteractiveRunner::run`] binds one session to a terminal: raw mode,
//! a copy pump in each direction, live resizing, scripted commands, and a
//! teardown that runs exactly once however the run ends.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::cleanup::Cleanup;
use super::feeder::{CommandFeeder, DEFAULT_COMMAND_DELAY, DEFAULT_SETTLE_DELAY};
use super::signals::{ShutdownSignals, WindowSizeSignals};
use super::terminal::{CrosstermTerminal, TerminalHost};
use crate::session::{
    detect_shell, SessionError, SessionId, SessionRegistry, SessionSpec, SessionStatus,
    DEFAULT_COLS, DEFAULT_ROWS,
};

/// Buffer size for the copy pumps.
const PUMP_BUFFER_SIZE: usize = 4096;

/// Default interval for polling whether the session is still running.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for trailing output after the process exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Timing and shell selection for interactive runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Shell used when the run spec does not name one.
    pub shell: String,
    /// Wait before the first scripted command.
    pub settle_delay: Duration,
    /// Pause between scripted commands.
    pub command_delay: Duration,
    /// Interval for polling whether the session is still running.
    pub poll_interval: Duration,
    /// Width used when the terminal size cannot be queried.
    pub cols: u16,
    /// Height used when the terminal size cannot be queried.
    pub rows: u16,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            shell: detect_shell(None),
            settle_delay: DEFAULT_SETTLE_DELAY,
            command_delay: DEFAULT_COMMAND_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

/// What to run interactively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InteractiveSpec {
    /// Session id to register under.
    pub id: SessionId,
    /// Commands typed into the shell once it settles.
    pub commands: Vec<String>,
    /// Shell override.
    pub shell: Option<String>,
    /// Arguments passed to the shell.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
}

impl InteractiveSpec {
    pub fn new(id: impl Into<SessionId>, commands: Vec<String>) -> Self {
        Self {
            id: id.into(),
            commands,
            ..Self::default()
        }
    }
}

/// Called with the exit status once a SIGINT or SIGTERM run has been
/// cleaned up. The default ends the process.
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

fn exit_process(code: i32) {
    std::process::exit(code)
}

/// Binds sessions from a registry to a terminal.
pub struct InteractiveRunner {
    registry: Arc<SessionRegistry>,
    terminal: Arc<dyn TerminalHost>,
    options: RunnerOptions,
    exit_hook: ExitHook,
}

impl InteractiveRunner {
    /// Creates a runner bound to the process's controlling terminal.
    pub fn new(registry: Arc<SessionRegistry>, options: RunnerOptions) -> Self {
        Self::with_terminal(registry, Arc::new(CrosstermTerminal::new()), options)
    }

    /// Creates a runner bound to an arbitrary terminal.
    pub fn with_terminal(
        registry: Arc<SessionRegistry>,
        terminal: Arc<dyn TerminalHost>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            registry,
            terminal,
            options,
            exit_hook: Arc::new(exit_process),
        }
    }

    /// Replaces what happens after cleanup when a run is interrupted.
    pub fn with_exit_hook(mut self, hook: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.exit_hook = Arc::new(hook);
        self
    }

    /// Runs `spec` in the foreground until the process exits.
    ///
    /// Fails with `TerminalMode` before spawning anything if raw mode cannot
    /// be entered. On SIGINT or SIGTERM the terminal is restored, the
    /// session killed, and the exit hook called with 0. If the hook returns,
    /// so does this, with the status of the killed session.
    pub async fn run(&self, spec: InteractiveSpec) -> Result<SessionStatus, SessionError> {
        self.terminal
            .enter_raw_mode()
            .map_err(|e| SessionError::TerminalMode(e.to_string()))?;

        let cleanup = Arc::new(Cleanup::new(
            Arc::clone(&self.terminal),
            Arc::clone(&self.registry),
        ));

        let mut shutdown_signals = match ShutdownSignals::register() {
            Ok(signals) => signals,
            Err(e) => {
                cleanup.run().await;
                return Err(e.into());
            }
        };

        // Spawning and binding happen within one poll of `run_bound`, so a
        // signal never observes a session that cleanup does not know about.
        let mut tasks = TaskGroup::default();
        let ending = tokio::select! {
            result = self.run_bound(&spec, &cleanup, &mut tasks) => Ending::Finished(result),
            signal = shutdown_signals.recv() => Ending::Interrupted(signal),
        };

        tasks.abort_all();
        cleanup.run().await;

        let result = match ending {
            Ending::Finished(result) => result,
            Ending::Interrupted(signal) => {
                tracing::info!(session_id = %spec.id, signal, "Interrupted, exiting");
                (self.exit_hook)(0);
                return Ok(cleanup
                    .session()
                    .map_or(SessionStatus::Killed, |session| session.status()));
            }
        };

        match &result {
            Ok(status) => {
                tracing::info!(
                    session_id = %spec.id,
                    status = ?status,
                    "Interactive session finished"
                );
            }
            Err(e) => {
                tracing::error!(session_id = %spec.id, error = %e, "Interactive session failed");
            }
        }

        result
    }

    async fn run_bound(
        &self,
        spec: &InteractiveSpec,
        cleanup: &Arc<Cleanup>,
        tasks: &mut TaskGroup,
    ) -> Result<SessionStatus, SessionError> {
        let (cols, rows) = self
            .terminal
            .size()
            .unwrap_or((self.options.cols, self.options.rows));
        let shell = spec
            .shell
            .clone()
            .unwrap_or_else(|| self.options.shell.clone());

        let session_spec = SessionSpec::new(spec.id.clone(), shell)
            .with_args(spec.args.clone())
            .with_size(rows, cols)
            .with_env(spec.env.clone())
            .with_cwd(spec.cwd.clone());
        let session = self.registry.spawn_session(session_spec).await?;
        cleanup.bind(Arc::clone(&session));

        sync_size(self.terminal.as_ref(), &self.registry, session.id()).await;

        match WindowSizeSignals::register() {
            Ok(mut window_signals) => {
                let terminal = Arc::clone(&self.terminal);
                let registry = Arc::clone(&self.registry);
                let session_id = session.id().clone();
                tasks.push(tokio::spawn(async move {
                    while window_signals.recv().await {
                        sync_size(terminal.as_ref(), &registry, &session_id).await;
                    }
                }));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for window size changes");
            }
        }

        let (pty_reader, pty_writer) = session.pty_master()?.split();
        spawn_pump(
            format!("pty-input-{}", session.id()),
            self.terminal.input(),
            pty_writer,
            None,
        );

        let (output_done_tx, output_done_rx) = oneshot::channel();
        spawn_pump(
            format!("pty-output-{}", session.id()),
            pty_reader,
            self.terminal.output(),
            Some(output_done_tx),
        );

        let feeder = CommandFeeder::new(self.options.settle_delay, self.options.command_delay);
        tasks.push(tokio::spawn({
            let session = Arc::clone(&session);
            let commands = spec.commands.clone();
            async move {
                feeder.feed(session, commands).await;
            }
        }));

        let status = session.wait_for_exit(self.options.poll_interval).await;

        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, output_done_rx)
            .await
            .is_err()
        {
            tracing::debug!(session_id = %session.id(), "Output pump still running after exit");
        }

        Ok(status)
    }
}

/// How the bound part of a run ended.
enum Ending {
    Finished(Result<SessionStatus, SessionError>),
    Interrupted(&'static str),
}

/// Propagates the terminal size to the session. Failures are warnings.
async fn sync_size(terminal: &dyn TerminalHost, registry: &SessionRegistry, session_id: &str) {
    let (cols, rows) = match terminal.size() {
        Ok(size) => size,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to query terminal size");
            return;
        }
    };

    if let Err(e) = registry.resize_session(session_id, rows, cols).await {
        tracing::warn!(session_id = %session_id, error = %e, "Failed to resize session");
    }
}

/// Copies `source` into `sink` on a dedicated thread until the source closes
/// or either side errors. Errors end the pump and are not reported.
fn spawn_pump<R, W>(name: String, mut source: R, mut sink: W, done: Option<oneshot::Sender<()>>)
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let thread_name = name.clone();
    let spawned = std::thread::Builder::new().name(thread_name).spawn(move || {
        let mut buffer = [0u8; PUMP_BUFFER_SIZE];
        loop {
            let n = match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(pump = %name, error = %e, "Pump source closed");
                    break;
                }
            };

            if let Err(e) = sink.write_all(&buffer[..n]).and_then(|()| sink.flush()) {
                tracing::debug!(pump = %name, error = %e, "Pump sink closed");
                break;
            }
        }

        if let Some(done) = done {
            let _ = done.send(());
        }
    });

    if let Err(e) = spawned {
        tracing::warn!(error = %e, "Failed to start copy pump");
    }
}

/// Background tasks of one run, aborted when the run ends.
#[derive(Default)]
struct TaskGroup {
    handles: Vec<JoinHandle<()>>,
}

impl TaskGroup {
    fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    fn abort_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.abort_all();
    }
}
