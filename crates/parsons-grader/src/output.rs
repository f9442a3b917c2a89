//! Thread-safe capture of what the guest writes before the test preamble
//! redirects `sys.stdout`.
//!
//! [`OutputBuffer`] is shared between the gateway side and the unit thread
//! via `Arc<Mutex<_>>`. A unit abandoned on timeout may still hold a clone;
//! [`into_strings`](OutputBuffer::into_strings) copes with that.

use std::sync::{Arc, Mutex};

use thiserror::Error;

/// A write was refused because the combined byte limit would be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Output limit exceeded: {limit_bytes} bytes")]
pub struct OutputLimitExceeded {
    pub limit_bytes: usize,
}

struct Inner {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    max_bytes: usize,
    limit_exceeded: bool,
}

impl Inner {
    fn accept(&mut self, len: usize) -> Result<(), OutputLimitExceeded> {
        if self.stdout.len() + self.stderr.len() + len > self.max_bytes {
            self.limit_exceeded = true;
            return Err(OutputLimitExceeded {
                limit_bytes: self.max_bytes,
            });
        }
        Ok(())
    }
}

/// Captured stdout/stderr of one execution unit. Clones share state.
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                stdout: Vec::new(),
                stderr: Vec::new(),
                max_bytes,
                limit_exceeded: false,
            })),
        }
    }

    /// Append to stdout. A refused write leaves the buffer unchanged and
    /// latches [`is_limit_exceeded`](Self::is_limit_exceeded).
    pub fn write_stdout(&self, data: &[u8]) -> Result<(), OutputLimitExceeded> {
        let mut inner = self.inner.lock().expect("OutputBuffer mutex poisoned");
        inner.accept(data.len())?;
        inner.stdout.extend_from_slice(data);
        Ok(())
    }

    pub fn write_stderr(&self, data: &[u8]) -> Result<(), OutputLimitExceeded> {
        let mut inner = self.inner.lock().expect("OutputBuffer mutex poisoned");
        inner.accept(data.len())?;
        inner.stderr.extend_from_slice(data);
        Ok(())
    }

    pub fn is_limit_exceeded(&self) -> bool {
        self.inner
            .lock()
            .expect("OutputBuffer mutex poisoned")
            .limit_exceeded
    }

    pub fn limit(&self) -> usize {
        self.inner.lock().expect("OutputBuffer mutex poisoned").max_bytes
    }

    /// `(stdout, stderr)` decoded lossily. Works while other clones are alive.
    pub fn into_strings(self) -> (String, String) {
        let decode = |inner: &Inner| {
            (
                String::from_utf8_lossy(&inner.stdout).into_owned(),
                String::from_utf8_lossy(&inner.stderr).into_owned(),
            )
        };
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => decode(&mutex.into_inner().expect("OutputBuffer mutex poisoned")),
            Err(shared) => decode(&shared.lock().expect("OutputBuffer mutex poisoned")),
        }
    }
}
