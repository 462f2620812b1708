//! Buffered connection and cancellation context
//!
//! [`BufferedConn`] wraps the underlying socket behind a small transport
//! trait so tests can substitute an in-memory duplex pipe. Reads go through
//! an internal buffer that supports non-consuming `peek`, which the PFSM
//! uses both for regex guards and for covertext accumulation.
//!
//! All blocking entry points take a [`Context`]: a cancellation token plus
//! an optional deadline, threaded through every plugin invocation. Blocking
//! is implemented as a poll loop with a short read timeout so cancellation
//! is observed promptly.

use crate::error::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a single blocking poll waits before rechecking the context
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Opportunistic top-up wait when data is already buffered
const TOPUP_INTERVAL: Duration = Duration::from_millis(5);

/// Cancellation token with an optional deadline.
///
/// Cloning shares the token; [`Context::with_deadline`] derives a child that
/// additionally expires.
#[derive(Debug, Clone)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never expires
    pub fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)), deadline: None }
    }

    /// Child context sharing this token, expiring after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            cancelled: self.cancelled.clone(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    /// Fire the token; all holders observe it
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with `Cancelled` or `Timeout` if this context is no longer live
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte transport under a [`BufferedConn`].
///
/// `set_read_timeout` must make subsequent reads fail with
/// `WouldBlock`/`TimedOut` instead of blocking forever; the poll loops rely
/// on it to observe cancellation.
pub trait Transport: Read + Write + Send {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;
    fn shutdown(&self) -> std::io::Result<()>;
}

impl Transport for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&self) -> std::io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Both)
    }
}

/// Buffered wrapper around the underlying connection
pub struct BufferedConn {
    inner: Box<dyn Transport>,
    buf: BytesMut,
    eof: bool,
}

impl std::fmt::Debug for BufferedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedConn")
            .field("buffered", &self.buf.len())
            .field("eof", &self.eof)
            .finish()
    }
}

impl BufferedConn {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self { inner: Box::new(transport), buf: BytesMut::new(), eof: false }
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    // One read against the transport with the given timeout. Returns how
    // many bytes arrived; 0 only on timeout.
    fn fill_once(&mut self, timeout: Duration) -> Result<usize> {
        if self.eof {
            return Err(Error::ConnectionClosed);
        }
        self.inner
            .set_read_timeout(Some(timeout))
            .map_err(|e| Error::Io(e.to_string()))?;

        let mut chunk = [0u8; 4096];
        match self.inner.read(&mut chunk) {
            Ok(0) => {
                self.eof = true;
                Err(Error::ConnectionClosed)
            }
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Non-consuming read.
    ///
    /// `n = -1` returns everything currently buffered, blocking until at
    /// least one byte is available; `n >= 0` blocks until `n` bytes are
    /// buffered. Cancellation and deadline are observed between polls.
    pub fn peek(&mut self, n: isize, ctx: &Context) -> Result<Bytes> {
        if n < 0 {
            while self.buf.is_empty() {
                ctx.check()?;
                self.fill_once(POLL_INTERVAL)?;
            }
            // Data is waiting; top up once so a covertext split across
            // segments does not spin the retry loop.
            let _ = self.fill_once(TOPUP_INTERVAL);
            return Ok(Bytes::copy_from_slice(&self.buf));
        }

        let n = n as usize;
        while self.buf.len() < n {
            ctx.check()?;
            self.fill_once(POLL_INTERVAL)?;
        }
        Ok(Bytes::copy_from_slice(&self.buf[..n]))
    }

    /// Consume exactly `n` bytes
    pub fn read_full(&mut self, n: usize, ctx: &Context) -> Result<Bytes> {
        while self.buf.len() < n {
            ctx.check()?;
            self.fill_once(POLL_INTERVAL)?;
        }
        let out = Bytes::copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        Ok(out)
    }

    /// Write all of `data` to the underlying connection
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Shut down the underlying connection
    pub fn close(&mut self) -> Result<()> {
        self.inner.shutdown().map_err(|e| Error::Io(e.to_string()))
    }
}

// ========== In-memory pipe ==========

#[derive(Debug, Default)]
struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

type Shared = Arc<(Mutex<PipeState>, Condvar)>;

/// One endpoint of an in-memory duplex byte pipe.
///
/// Stands in for a TCP socket in tests; both halves implement [`Transport`].
pub struct Pipe {
    rx: Shared,
    tx: Shared,
    read_timeout: Mutex<Option<Duration>>,
}

/// Create a connected pair of pipe endpoints
pub fn pipe() -> (Pipe, Pipe) {
    let a: Shared = Arc::new((Mutex::new(PipeState::default()), Condvar::new()));
    let b: Shared = Arc::new((Mutex::new(PipeState::default()), Condvar::new()));
    (
        Pipe { rx: a.clone(), tx: b.clone(), read_timeout: Mutex::new(None) },
        Pipe { rx: b, tx: a, read_timeout: Mutex::new(None) },
    )
}

impl Read for Pipe {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let timeout = *self.read_timeout.lock();
        let (lock, cv) = &*self.rx;
        let mut state = lock.lock();
        while state.buf.is_empty() {
            if state.closed {
                return Ok(0);
            }
            match timeout {
                Some(t) => {
                    if cv.wait_for(&mut state, t).timed_out() && state.buf.is_empty() {
                        if state.closed {
                            return Ok(0);
                        }
                        return Err(std::io::Error::from(std::io::ErrorKind::TimedOut));
                    }
                }
                None => cv.wait(&mut state),
            }
        }
        let n = out.len().min(state.buf.len());
        for slot in out.iter_mut().take(n) {
            *slot = state.buf.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for Pipe {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let (lock, cv) = &*self.tx;
        let mut state = lock.lock();
        if state.closed {
            return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        }
        state.buf.extend(data);
        cv.notify_all();
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Transport for Pipe {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        *self.read_timeout.lock() = timeout;
        Ok(())
    }

    fn shutdown(&self) -> std::io::Result<()> {
        for side in [&self.rx, &self.tx] {
            let (lock, cv) = &**side;
            lock.lock().closed = true;
            cv.notify_all();
        }
        Ok(())
    }
}
