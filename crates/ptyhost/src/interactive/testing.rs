//! In-memory terminal for exercising the runner without a TTY.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::terminal::TerminalHost;

/// Output sink shared between the runner and the test.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        let data = self.0.lock().unwrap();
        String::from_utf8_lossy(&data).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Terminal double: records mode changes, reads nothing, captures output.
pub struct FakeTerminal {
    raw: AtomicBool,
    fail_raw_mode: bool,
    restores: AtomicUsize,
    size: (u16, u16),
    output: SharedBuffer,
}

impl FakeTerminal {
    pub fn new() -> Self {
        Self {
            raw: AtomicBool::new(false),
            fail_raw_mode: false,
            restores: AtomicUsize::new(0),
            size: (100, 30),
            output: SharedBuffer::default(),
        }
    }

    /// A terminal whose raw-mode switch always fails.
    pub fn failing() -> Self {
        Self {
            fail_raw_mode: true,
            ..Self::new()
        }
    }

    pub fn is_raw(&self) -> bool {
        self.raw.load(Ordering::SeqCst)
    }

    pub fn restore_count(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    pub fn output_buffer(&self) -> SharedBuffer {
        self.output.clone()
    }
}

impl TerminalHost for FakeTerminal {
    fn enter_raw_mode(&self) -> io::Result<()> {
        if self.fail_raw_mode {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "not a terminal"));
        }
        self.raw.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn restore(&self) -> io::Result<()> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        self.raw.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn size(&self) -> io::Result<(u16, u16)> {
        Ok(self.size)
    }

    fn input(&self) -> Box<dyn Read + Send> {
        Box::new(io::empty())
    }

    fn output(&self) -> Box<dyn Write + Send> {
        Box::new(self.output.clone())
    }
}
