//! Exactly-once teardown for an interactive run.
//!
//! Every exit path of the runner (normal completion, error return, signal)
//! calls [`Cleanup::run`]. The first caller restores the terminal and kills
//! the bound session; concurrent callers wait for it to finish and later
//! callers return immediately.

use std::sync::{Arc, OnceLock};

use tokio::sync::OnceCell;

use super::terminal::TerminalHost;
use crate::session::{Session, SessionRegistry};

/// Teardown shared by every exit path of one interactive run.
pub struct Cleanup {
    terminal: Arc<dyn TerminalHost>,
    registry: Arc<SessionRegistry>,
    session: OnceLock<Arc<Session>>,
    done: OnceCell<()>,
}

impl Cleanup {
    pub fn new(terminal: Arc<dyn TerminalHost>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            terminal,
            registry,
            session: OnceLock::new(),
            done: OnceCell::new(),
        }
    }

    /// Binds the session this cleanup kills. Later binds are ignored.
    pub fn bind(&self, session: Arc<Session>) {
        if self.session.set(session).is_err() {
            tracing::warn!("Cleanup already bound to a session");
        }
    }

    /// Returns the bound session, if any.
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.get()
    }

    /// Restores the terminal and kills the bound session.
    ///
    /// Failures are logged. Already released resources are not an error.
    pub async fn run(&self) {
        self.done
            .get_or_init(|| async {
                if let Err(e) = self.terminal.restore() {
                    tracing::warn!(error = %e, "Failed to restore terminal mode");
                }

                if let Some(session) = self.session.get() {
                    match self.registry.reap(session).await {
                        Ok(()) => {
                            tracing::debug!(
                                session_id = %session.id(),
                                "Interactive session cleaned up"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                session_id = %session.id(),
                                error = %e,
                                "Failed to kill session during cleanup"
                            );
                        }
                    }
                }
            })
            .await;
    }

    /// Returns whether cleanup has completed.
    pub fn has_run(&self) -> bool {
        self.done.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interactive::testing::FakeTerminal;

    #[tokio::test]
    async fn test_cleanup_runs_once() {
        let terminal = Arc::new(FakeTerminal::new());
        terminal.enter_raw_mode().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let cleanup = Cleanup::new(terminal.clone(), Arc::clone(&registry));

        let session = registry
            .create_session("cleanup", "/bin/sh", vec![])
            .await
            .unwrap();
        cleanup.bind(Arc::clone(&session));
        assert!(Arc::ptr_eq(cleanup.session().unwrap(), &session));

        cleanup.run().await;
        cleanup.run().await;

        assert!(cleanup.has_run());
        assert_eq!(terminal.restore_count(), 1);
        assert!(!session.is_running());
        assert!(!registry.contains("cleanup").await);
    }

    #[tokio::test]
    async fn test_cleanup_concurrent_callers() {
        let terminal = Arc::new(FakeTerminal::new());
        terminal.enter_raw_mode().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let cleanup = Arc::new(Cleanup::new(terminal.clone(), Arc::clone(&registry)));

        let session = registry
            .create_session("concurrent", "/bin/sh", vec![])
            .await
            .unwrap();
        cleanup.bind(session);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cleanup = Arc::clone(&cleanup);
                tokio::spawn(async move { cleanup.run().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(terminal.restore_count(), 1);
        assert!(registry.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_after_session_already_reaped() {
        let terminal = Arc::new(FakeTerminal::new());
        terminal.enter_raw_mode().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let cleanup = Cleanup::new(terminal.clone(), Arc::clone(&registry));

        let session = registry
            .create_session("gone", "/bin/sh", vec![])
            .await
            .unwrap();
        cleanup.bind(session);
        registry.kill_session("gone").await.unwrap();

        cleanup.run().await;

        assert!(cleanup.has_run());
        assert_eq!(terminal.restore_count(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_without_session() {
        let terminal = Arc::new(FakeTerminal::new());
        terminal.enter_raw_mode().unwrap();
        let cleanup = Cleanup::new(terminal.clone(), Arc::new(SessionRegistry::new()));
        assert!(cleanup.session().is_none());

        cleanup.run().await;

        assert_eq!(terminal.restore_count(), 1);
        assert!(!terminal.is_raw());
    }
}
