//! Child output plumbing: the shared stderr sink and the per-component
//! line prefixer that tags everything a child writes.

mod prefixer;

pub use prefixer::LogPrefixer;

use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;

/// A cloneable, mutex-guarded writer shared by every copier task.
///
/// One `write_all` is one critical section, so a prefixed chunk from one
/// child is never interleaved with a chunk from another.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").finish_non_exhaustive()
    }
}

impl LogSink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// A sink that discards everything
    pub fn null() -> Self {
        Self::new(io::sink())
    }

    /// An in-memory sink plus a handle for reading back what was written
    pub fn capture() -> (Self, SharedBuffer) {
        let buf = SharedBuffer::default();
        (Self::new(buf.clone()), buf)
    }

    /// Same sink, every line tagged with `prefix`
    pub fn prefixed(&self, prefix: impl Into<Vec<u8>>) -> LogPrefixer<LogSink> {
        LogPrefixer::new(self.clone(), prefix)
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.lock().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// Growable byte buffer that can be written from one place and read from
/// another. Used to capture child stdout and in tests.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
