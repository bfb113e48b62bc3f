//! Session registry for managing multiple PTY sessions.
//!
//! The registry owns every live [`Session`] behind a single read/write lock
//! and runs one lifecycle watcher per session. A watcher waits for the
//! process to exit or the session token to fire, then removes the session
//! and releases its PTY while holding the write lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::output::OutputStream;
use super::pty::{Session, SessionError, SessionId, SessionSpec};

/// Default interval at which watchers poll for process exit.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_millis(50);

/// Default cap on concurrently live sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 64;

type SessionMap = RwLock<HashMap<SessionId, Arc<Session>>>;

/// Tuning for a [`SessionRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOptions {
    /// How often lifecycle watchers poll for process exit.
    pub watch_interval: Duration,
    /// Maximum number of live sessions.
    pub max_sessions: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            watch_interval: DEFAULT_WATCH_INTERVAL,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// Concurrency-safe collection of live sessions.
///
/// Construct one at the composition root and share it by `Arc`.
pub struct SessionRegistry {
    /// Map of session ID to session.
    sessions: Arc<SessionMap>,
    /// Parent of every session token. Cancelling it kills every session.
    root_token: CancellationToken,
    options: RegistryOptions,
}

impl SessionRegistry {
    /// Creates a registry with default options.
    pub fn new() -> Self {
        Self::with_options(RegistryOptions::default())
    }

    /// Creates a registry with the given options.
    pub fn with_options(options: RegistryOptions) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            root_token: CancellationToken::new(),
            options,
        }
    }

    /// Spawns `shell` with `args` behind a new PTY under `id`.
    pub async fn create_session(
        &self,
        id: impl Into<SessionId>,
        shell: impl Into<String>,
        args: Vec<String>,
    ) -> Result<Arc<Session>, SessionError> {
        self.spawn_session(SessionSpec::new(id, shell).with_args(args))
            .await
    }

    /// Spawns a session from a full spec and starts its lifecycle watcher.
    ///
    /// Fails with `AlreadyExists` if the id is live. On any failure nothing
    /// is inserted.
    pub async fn spawn_session(&self, spec: SessionSpec) -> Result<Arc<Session>, SessionError> {
        let mut sessions = self.sessions.write().await;

        if self.root_token.is_cancelled() {
            return Err(SessionError::RegistryClosed);
        }

        if sessions.contains_key(&spec.id) {
            return Err(SessionError::AlreadyExists(spec.id));
        }

        if sessions.len() >= self.options.max_sessions {
            return Err(SessionError::SessionLimitReached(sessions.len()));
        }

        let session = Arc::new(Session::spawn(&spec, self.root_token.child_token())?);
        sessions.insert(spec.id.clone(), Arc::clone(&session));
        self.start_watcher(Arc::clone(&session));

        tracing::info!(
            session_id = %spec.id,
            shell = %spec.shell,
            pid = session.pid(),
            cols = spec.cols,
            rows = spec.rows,
            "Created new session"
        );

        Ok(session)
    }

    /// Kills a session and removes it from the registry.
    ///
    /// A second call for the same id returns `NotFound`.
    pub async fn kill_session(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;

        let session = sessions
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let result = release(&session).await;

        tracing::info!(
            session_id = %session_id,
            status = ?session.status(),
            "Session killed and removed"
        );

        result
    }

    /// Removes `session` if it is still the registered instance for its id,
    /// then releases it. Releasing an already released session is a no-op.
    pub async fn reap(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        reap(&self.sessions, session).await
    }

    /// Resizes a session's terminal.
    pub async fn resize_session(
        &self,
        session_id: &str,
        rows: u16,
        cols: u16,
    ) -> Result<(), SessionError> {
        self.get_session(session_id).await?.resize(rows, cols)
    }

    /// Writes data to a session's input.
    pub async fn write_input(&self, session_id: &str, data: &[u8]) -> Result<(), SessionError> {
        self.get_session(session_id).await?.write_input(data)
    }

    /// Returns a new output stream for a live session.
    pub async fn attach(&self, session_id: &str) -> Result<OutputStream, SessionError> {
        let session = self.get_session(session_id).await?;

        if !session.is_running() {
            return Err(SessionError::AlreadyTerminated(session_id.to_string()));
        }

        let stream = session.output_stream()?;
        tracing::debug!(session_id = %session_id, "Attached output stream");
        Ok(stream)
    }

    /// Looks up a live session.
    pub async fn get_session(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Returns a snapshot of the live sessions.
    ///
    /// Later registry changes do not affect the returned map.
    pub async fn list_sessions(&self) -> HashMap<SessionId, Arc<Session>> {
        self.sessions.read().await.clone()
    }

    /// Returns whether a session with this id is live.
    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Returns the number of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Kills every session and empties the registry.
    ///
    /// Individual kill failures are logged and do not fail the shutdown.
    /// The registry rejects new sessions afterwards.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.root_token.cancel();

        let mut sessions = self.sessions.write().await;
        let drained: Vec<Arc<Session>> = sessions.drain().map(|(_, session)| session).collect();
        let count = drained.len();

        let results = join_all(drained.iter().map(release)).await;
        for (session, result) in drained.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(
                    session_id = %session.id(),
                    error = %e,
                    "Failed to kill session during shutdown"
                );
            }
        }

        tracing::info!(sessions = count, "Session registry shut down");
        Ok(())
    }

    /// Returns whether `shutdown` has been called.
    pub fn is_shut_down(&self) -> bool {
        self.root_token.is_cancelled()
    }

    /// Starts the lifecycle watcher for a freshly inserted session.
    fn start_watcher(&self, session: Arc<Session>) {
        let sessions = Arc::clone(&self.sessions);
        let interval = self.options.watch_interval;

        tokio::spawn(async move {
            let token = session.cancel_token().clone();

            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(session_id = %session.id(), "Watcher cancelled");
                }
                status = session.wait_for_exit(interval) => {
                    tracing::debug!(
                        session_id = %session.id(),
                        status = ?status,
                        "Watcher observed process exit"
                    );
                }
            }

            if let Err(e) = reap(&sessions, &session).await {
                tracing::warn!(
                    session_id = %session.id(),
                    error = %e,
                    "Failed to release session"
                );
            }
        });
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        // Watchers hold their own handle on the map and reap on cancellation.
        self.root_token.cancel();
    }
}

async fn reap(sessions: &SessionMap, session: &Arc<Session>) -> Result<(), SessionError> {
    let mut map = sessions.write().await;

    let registered = map
        .get(session.id())
        .is_some_and(|current| Arc::ptr_eq(current, session));
    if registered {
        map.remove(session.id());
        tracing::info!(
            session_id = %session.id(),
            status = ?session.status(),
            "Reaped session"
        );
    }

    release(session).await
}

/// Releases a session off the async worker threads; killing a process can
/// wait on its grace period.
async fn release(session: &Arc<Session>) -> Result<(), SessionError> {
    let session = Arc::clone(session);
    tokio::task::spawn_blocking(move || session.release())
        .await
        .map_err(|e| SessionError::KillFailed(format!("release task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use futures_util::StreamExt;
    use tokio::time::timeout;

    fn sh() -> String {
        "/bin/sh".to_string()
    }

    async fn wait_until_absent(registry: &SessionRegistry, id: &str) -> bool {
        for _ in 0..100 {
            if !registry.contains(id).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_registry_create_session() {
        let registry = SessionRegistry::new();

        let result = registry.create_session("s1", sh(), vec![]).await;
        assert!(result.is_ok(), "Failed to create session: {:?}", result.err());

        let session = result.unwrap();
        assert_eq!(session.id(), "s1");
        assert!(session.is_running());
        assert!(registry.contains("s1").await);
        assert_eq!(registry.count().await, 1);

        registry.kill_session("s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_duplicate_id() {
        let registry = SessionRegistry::new();

        let original = registry.create_session("dup", sh(), vec![]).await.unwrap();
        let pid = original.pid();

        let result = registry.create_session("dup", sh(), vec![]).await;
        assert!(matches!(result, Err(SessionError::AlreadyExists(ref id)) if id == "dup"));

        // The original session is untouched.
        assert!(original.is_running());
        let current = registry.get_session("dup").await.unwrap();
        assert!(Arc::ptr_eq(&current, &original));
        assert_eq!(current.pid(), pid);
        assert_eq!(registry.count().await, 1);

        registry.kill_session("dup").await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_spawn_failure_leaves_no_entry() {
        let registry = SessionRegistry::new();

        let result = registry
            .create_session("bad", "/nonexistent/not-a-shell", vec![])
            .await;

        assert!(matches!(result, Err(SessionError::ProcessSpawnFailed(_))));
        assert!(!registry.contains("bad").await);
    }

    #[tokio::test]
    async fn test_registry_kill() {
        let registry = SessionRegistry::new();

        let session = registry.create_session("k", sh(), vec![]).await.unwrap();

        registry.kill_session("k").await.unwrap();

        assert!(!registry.contains("k").await);
        assert!(!session.is_running());
        assert_eq!(session.status(), SessionStatus::Killed);
        assert!(session.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_registry_kill_twice() {
        let registry = SessionRegistry::new();

        registry.create_session("k2", sh(), vec![]).await.unwrap();
        registry.kill_session("k2").await.unwrap();

        let result = registry.kill_session("k2").await;
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_registry_kill_nonexistent() {
        let registry = SessionRegistry::new();

        let result = registry.kill_session("nonexistent").await;
        assert!(matches!(result, Err(SessionError::NotFound(ref id)) if id == "nonexistent"));
    }

    #[tokio::test]
    async fn test_registry_resize() {
        let registry = SessionRegistry::new();

        let session = registry.create_session("r", sh(), vec![]).await.unwrap();

        registry.resize_session("r", 40, 120).await.unwrap();

        assert!(session.is_running());
        let info = session.info();
        assert_eq!((info.rows, info.cols), (40, 120));

        registry.kill_session("r").await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_resize_nonexistent() {
        let registry = SessionRegistry::new();

        let result = registry.resize_session("ghost", 24, 80).await;
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_registry_list_is_snapshot() {
        let registry = SessionRegistry::new();

        registry.create_session("a", sh(), vec![]).await.unwrap();
        registry.create_session("b", sh(), vec![]).await.unwrap();

        let snapshot = registry.list_sessions().await;
        assert_eq!(snapshot.len(), 2);

        registry.kill_session("a").await.unwrap();

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains_key("a"));
        assert_eq!(registry.list_sessions().await.len(), 1);

        registry.kill_session("b").await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_empty_list() {
        let registry = SessionRegistry::new();
        assert!(registry.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_registry_watcher_reaps_exited_process() {
        let registry = SessionRegistry::new();

        let session = registry
            .create_session("short", sh(), vec!["-c".to_string(), "exit 0".to_string()])
            .await
            .unwrap();

        assert!(wait_until_absent(&registry, "short").await);
        assert!(!session.is_running());
        assert_eq!(session.status(), SessionStatus::Exited(0));
        assert!(session.status().is_terminal());
    }

    #[tokio::test]
    async fn test_registry_id_reusable_after_exit() {
        let registry = SessionRegistry::new();

        registry
            .create_session("reuse", sh(), vec!["-c".to_string(), "exit 0".to_string()])
            .await
            .unwrap();
        assert!(wait_until_absent(&registry, "reuse").await);

        let second = registry.create_session("reuse", sh(), vec![]).await.unwrap();
        assert!(second.is_running());

        registry.kill_session("reuse").await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_session_limit() {
        let registry = SessionRegistry::with_options(RegistryOptions {
            max_sessions: 1,
            ..RegistryOptions::default()
        });

        registry.create_session("one", sh(), vec![]).await.unwrap();

        let result = registry.create_session("two", sh(), vec![]).await;
        assert!(matches!(result, Err(SessionError::SessionLimitReached(1))));

        registry.kill_session("one").await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_shutdown() {
        let registry = SessionRegistry::new();

        let a = registry.create_session("a", sh(), vec![]).await.unwrap();
        let b = registry.create_session("b", sh(), vec![]).await.unwrap();
        let c = registry.create_session("c", sh(), vec![]).await.unwrap();

        registry.shutdown().await.unwrap();

        assert!(registry.list_sessions().await.is_empty());
        for session in [&a, &b, &c] {
            assert!(!session.is_running());
        }
        assert!(matches!(
            registry.get_session("a").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(registry.is_shut_down());
    }

    #[tokio::test]
    async fn test_registry_create_after_shutdown() {
        let registry = SessionRegistry::new();
        registry.shutdown().await.unwrap();

        let result = registry.create_session("late", sh(), vec![]).await;
        assert!(matches!(result, Err(SessionError::RegistryClosed)));
    }

    #[tokio::test]
    async fn test_registry_write_and_attach() {
        let registry = SessionRegistry::new();

        registry.create_session("io", sh(), vec![]).await.unwrap();
        let mut output = registry.attach("io").await.unwrap();

        registry
            .write_input("io", b"echo registry_roundtrip_marker\n")
            .await
            .unwrap();

        let mut found = false;
        for _ in 0..50 {
            if let Ok(Some(chunk)) = timeout(Duration::from_millis(100), output.next()).await {
                if String::from_utf8_lossy(&chunk).contains("registry_roundtrip_marker") {
                    found = true;
                    break;
                }
            }
        }
        assert!(found, "Did not receive expected output");

        registry.kill_session("io").await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_reap_ignores_replaced_instance() {
        let registry = SessionRegistry::new();

        let first = registry.create_session("same", sh(), vec![]).await.unwrap();
        registry.kill_session("same").await.unwrap();
        let second = registry.create_session("same", sh(), vec![]).await.unwrap();

        // Reaping the stale instance must not remove its successor.
        registry.reap(&first).await.unwrap();

        assert!(registry.contains("same").await);
        assert!(second.is_running());

        registry.kill_session("same").await.unwrap();
    }
}
