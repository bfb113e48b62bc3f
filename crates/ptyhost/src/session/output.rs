//! Session output streaming.
//!
//! An [`OutputStream`] is a lazy sequence of byte chunks read from a
//! session's PTY. It ends when the PTY closes and is not restartable:
//! attaching again yields a new stream that starts at the current output.

use std::io::Read;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use super::pty::{PtyReader, SessionError, SessionId};

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Chunks buffered between the reader thread and the consumer.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Stream of output chunks from one session.
///
/// Reads happen on a dedicated thread because PTY reads block. Only one
/// reader should be active per session; concurrent readers split the
/// output between them.
pub struct OutputStream {
    session_id: SessionId,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl OutputStream {
    /// Starts the reader thread for `reader`.
    pub(crate) fn spawn(
        session_id: SessionId,
        mut reader: PtyReader,
    ) -> Result<Self, SessionError> {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let thread_session_id = session_id.clone();

        std::thread::Builder::new()
            .name(format!("pty-output-{session_id}"))
            .spawn(move || {
                let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) => {
                            tracing::debug!(session_id = %thread_session_id, "PTY EOF");
                            break;
                        }
                        Ok(n) => {
                            if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                                tracing::trace!(
                                    session_id = %thread_session_id,
                                    "Output stream dropped"
                                );
                                break;
                            }
                        }
                        Err(e) => {
                            // Linux reports EIO once the slave side closes.
                            tracing::debug!(
                                session_id = %thread_session_id,
                                error = %e,
                                "PTY read ended"
                            );
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { session_id, rx })
    }

    /// Returns the id of the session this stream reads from.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl Stream for OutputStream {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
