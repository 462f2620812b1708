//! Stream multiplexing
//!
//! Streams are bidirectional byte pipes multiplexed over one underlying
//! connection. The sender frames queued bytes into cells with monotonically
//! increasing sequence IDs; the receiver reassembles cells in sequence
//! order through a bounded reorder window.
//!
//! # Stream Lifecycle
//!
//! 1. Local side calls [`StreamSet::create`] (or the remote side's first
//!    cell creates the stream implicitly)
//! 2. NORMAL cells flow in both directions
//! 3. Each side sends one END_OF_STREAM cell after its outgoing queue drains
//! 4. When both directions are closed and drained, the stream is reaped
//!
//! # Reassembly
//!
//! Bytes surfaced to the application are a strict prefix of the cells in
//! ascending sequence order: duplicates are dropped, future cells are parked
//! in a bounded window, and a gap that overflows the window fails the
//! connection.

use crate::cell::{Cell, CellType};
use crate::conn::Context;
use crate::error::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Maximum number of out-of-order cells parked per stream
pub const REORDER_WINDOW: usize = 512;

/// Outgoing queue cap; writers block past this
pub const SEND_BUFFER_MAX: usize = 1 << 20;

/// Poll interval for blocking stream operations
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct SendHalf {
    buf: VecDeque<u8>,
    /// Next sequence ID to assign; sequence IDs start at 1
    next_seq: u32,
    /// Local side has closed; emit END_OF_STREAM once the queue drains
    closed: bool,
    /// END_OF_STREAM has been dequeued
    eos_sent: bool,
}

#[derive(Debug, Default)]
struct RecvHalf {
    /// In-order bytes ready for the application
    ready: BytesMut,
    /// Next expected sequence ID
    next_seq: u32,
    /// Cells ahead of `next_seq`, keyed by sequence ID
    pending: BTreeMap<u32, Cell>,
    /// END_OF_STREAM consumed in order
    closed: bool,
}

#[derive(Debug)]
struct StreamInner {
    send: SendHalf,
    recv: RecvHalf,
}

/// One logical byte channel inside a connection
#[derive(Debug)]
pub struct Stream {
    id: u32,
    inner: Mutex<StreamInner>,
    readable: Condvar,
    writable: Condvar,
}

impl Stream {
    fn new(id: u32) -> Self {
        Self {
            id,
            inner: Mutex::new(StreamInner {
                send: SendHalf { next_seq: 1, ..Default::default() },
                recv: RecvHalf { next_seq: 1, ..Default::default() },
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Queue bytes for framing. Blocks while the outgoing queue is full.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        while inner.send.buf.len() >= SEND_BUFFER_MAX {
            if inner.send.closed {
                return Err(Error::StreamClosed(self.id));
            }
            self.writable.wait_for(&mut inner, POLL_INTERVAL);
        }
        if inner.send.closed {
            return Err(Error::StreamClosed(self.id));
        }
        inner.send.buf.extend(data);
        Ok(data.len())
    }

    /// Read reassembled bytes. Blocks until data is available; returns 0 at
    /// end of stream.
    pub fn read(&self, out: &mut [u8], ctx: &Context) -> Result<usize> {
        let mut inner = self.inner.lock();
        loop {
            if !inner.recv.ready.is_empty() {
                let n = out.len().min(inner.recv.ready.len());
                out[..n].copy_from_slice(&inner.recv.ready[..n]);
                inner.recv.ready.advance(n);
                return Ok(n);
            }
            if inner.recv.closed {
                return Ok(0);
            }
            ctx.check()?;
            self.readable.wait_for(&mut inner, POLL_INTERVAL);
        }
    }

    /// Half-close the outgoing direction; an END_OF_STREAM cell follows the
    /// queued bytes out.
    pub fn close_write(&self) {
        let mut inner = self.inner.lock();
        inner.send.closed = true;
        self.readable.notify_all();
    }

    /// Close both directions
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.send.closed = true;
        inner.recv.closed = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// True once both directions are closed and drained
    fn is_finished(&self) -> bool {
        let inner = self.inner.lock();
        inner.send.closed
            && inner.send.eos_sent
            && inner.send.buf.is_empty()
            && inner.recv.closed
            && inner.recv.ready.is_empty()
    }

    fn has_pending_send(&self) -> bool {
        let inner = self.inner.lock();
        !inner.send.buf.is_empty() || (inner.send.closed && !inner.send.eos_sent)
    }

    // Build the next outgoing cell, if any.
    fn dequeue_cell(&self, max_payload: usize) -> Option<Cell> {
        let mut inner = self.inner.lock();

        if !inner.send.buf.is_empty() {
            let n = max_payload.min(inner.send.buf.len());
            let payload: Bytes = inner.send.buf.drain(..n).collect::<Vec<u8>>().into();
            let seq = inner.send.next_seq;
            inner.send.next_seq += 1;
            self.writable.notify_all();
            return Some(Cell::new(CellType::Normal, self.id, seq, payload));
        }

        if inner.send.closed && !inner.send.eos_sent {
            inner.send.eos_sent = true;
            let seq = inner.send.next_seq;
            inner.send.next_seq += 1;
            return Some(Cell::new(CellType::EndOfStream, self.id, seq, Bytes::new()));
        }

        None
    }

    // Accept an incoming cell, reordering by sequence ID.
    fn enqueue_cell(&self, cell: Cell) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let seq = cell.sequence_id;
        if seq < inner.recv.next_seq || inner.recv.pending.contains_key(&seq) {
            tracing::trace!(stream = self.id, seq, "duplicate cell dropped");
            return Ok(());
        }

        inner.recv.pending.insert(seq, cell);
        if inner.recv.pending.len() > REORDER_WINDOW {
            return Err(Error::ReorderWindowExceeded(self.id));
        }

        // Drain the run of in-order cells.
        while let Some(cell) = inner.recv.pending.remove(&inner.recv.next_seq) {
            inner.recv.next_seq += 1;
            match cell.cell_type {
                CellType::Normal => inner.recv.ready.extend_from_slice(&cell.payload),
                CellType::EndOfStream => {
                    inner.recv.closed = true;
                    inner.recv.pending.clear();
                    break;
                }
            }
        }
        self.readable.notify_all();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SetInner {
    streams: BTreeMap<u32, Arc<Stream>>,
    /// Remote-initiated streams awaiting `accept`
    accepted: VecDeque<Arc<Stream>>,
    closed: bool,
}

/// Owns the `stream_id -> stream` mapping for one connection.
///
/// Cloning shares the set; the PFSM, the dialer/listener that spawned it,
/// and the proxy pumps all hold the same instance.
#[derive(Debug, Clone, Default)]
pub struct StreamSet {
    inner: Arc<(Mutex<SetInner>, Condvar)>,
    next_id: Arc<AtomicU32>,
}

impl StreamSet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(SetInner::default()), Condvar::new())),
            next_id: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Create a locally-initiated stream with a fresh nonzero ID
    pub fn create(&self) -> Arc<Stream> {
        let mut id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if id == 0 {
            id = self.next_id.fetch_add(1, Ordering::SeqCst);
        }
        let stream = Arc::new(Stream::new(id));
        let (lock, _) = &*self.inner;
        lock.lock().streams.insert(id, stream.clone());
        stream
    }

    /// Look up a stream by ID
    pub fn get(&self, id: u32) -> Option<Arc<Stream>> {
        let (lock, _) = &*self.inner;
        lock.lock().streams.get(&id).cloned()
    }

    /// Number of live streams
    pub fn len(&self) -> usize {
        let (lock, _) = &*self.inner;
        lock.lock().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route an incoming cell to its stream, creating the stream on first
    /// sight of a remote-initiated ID. Control cells (stream 0) carry no
    /// payload and are dropped here.
    pub fn enqueue(&self, cell: Cell) -> Result<()> {
        if cell.stream_id == 0 {
            return Ok(());
        }

        let (stream, newly_created) = {
            let (lock, cv) = &*self.inner;
            let mut guard = lock.lock();
            let set = &mut *guard;
            if set.closed {
                return Err(Error::StreamClosed(cell.stream_id));
            }
            match set.streams.get(&cell.stream_id) {
                Some(s) => (s.clone(), false),
                None => {
                    let s = Arc::new(Stream::new(cell.stream_id));
                    set.streams.insert(cell.stream_id, s.clone());
                    set.accepted.push_back(s.clone());
                    cv.notify_all();
                    (s, true)
                }
            }
        };
        if newly_created {
            tracing::debug!(stream = cell.stream_id, "remote stream opened");
        }
        stream.enqueue_cell(cell)
    }

    /// Pull the next outgoing cell across all streams, lowest ID first.
    /// Returns `None` when no stream has bytes or a pending END_OF_STREAM.
    pub fn dequeue(&self, max_payload: usize) -> Option<Cell> {
        let candidates: Vec<Arc<Stream>> = {
            let (lock, _) = &*self.inner;
            lock.lock().streams.values().cloned().collect()
        };

        let mut cell = None;
        for stream in &candidates {
            if let Some(c) = stream.dequeue_cell(max_payload) {
                cell = Some(c);
                break;
            }
        }

        // Reap streams that are fully finished.
        let (lock, _) = &*self.inner;
        let mut set = lock.lock();
        set.streams.retain(|_, s| !s.is_finished());

        cell
    }

    /// True if any stream has bytes ready to frame
    pub fn has_pending(&self) -> bool {
        let (lock, _) = &*self.inner;
        let set = lock.lock();
        set.streams.values().any(|s| s.has_pending_send())
    }

    /// Streams with bytes or a pending END_OF_STREAM to emit, lowest ID first
    pub fn ready(&self) -> Vec<Arc<Stream>> {
        let (lock, _) = &*self.inner;
        let set = lock.lock();
        set.streams.values().filter(|s| s.has_pending_send()).cloned().collect()
    }

    /// Block until a remote-initiated stream appears
    pub fn accept(&self, ctx: &Context) -> Result<Arc<Stream>> {
        let (lock, cv) = &*self.inner;
        let mut set = lock.lock();
        loop {
            if let Some(stream) = set.accepted.pop_front() {
                return Ok(stream);
            }
            if set.closed {
                return Err(Error::ConnectionClosed);
            }
            ctx.check()?;
            cv.wait_for(&mut set, POLL_INTERVAL);
        }
    }

    /// Close every stream and refuse new ones
    pub fn close(&self) {
        let streams: Vec<Arc<Stream>> = {
            let (lock, cv) = &*self.inner;
            let mut set = lock.lock();
            set.closed = true;
            cv.notify_all();
            set.streams.values().cloned().collect()
        };
        for stream in streams {
            stream.close();
        }
    }
}
