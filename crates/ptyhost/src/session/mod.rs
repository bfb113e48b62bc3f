//! Session management module.
//!
//! This module provides PTY spawning and session lifecycle management.
//! Sessions can be created, written to, streamed from, resized, and killed.

pub mod output;
pub mod pty;
pub mod registry;

pub use output::OutputStream;
pub use pty::{
    detect_shell, PtyMaster, PtyReader, PtyWriter, Session, SessionError, SessionId, SessionInfo,
    SessionSpec, SessionStatus, DEFAULT_COLS, DEFAULT_ROWS, FALLBACK_SHELL,
};
pub use registry::{RegistryOptions, SessionRegistry, DEFAULT_MAX_SESSIONS, DEFAULT_WATCH_INTERVAL};
