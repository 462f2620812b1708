//! Client-side dialer
//!
//! Owns one PFSM running against the remote server on its own thread.
//! Local connections are coupled to the session by [`Dialer::dial`], which
//! opens a fresh multiplexed stream; the FSM's send/recv transitions drain
//! and fill the shared stream set as the document dictates.

use crate::conn::Context;
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::mar::{Document, Party};
use crate::stream::{Stream, StreamSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

/// Drives one client session over one underlying connection
pub struct Dialer {
    stream_set: StreamSet,
    ctx: Context,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer").field("streams", &self.stream_set.len()).finish()
    }
}

impl Dialer {
    /// Build the client FSM and start executing it. The connection to
    /// `host` is dialed on the FSM thread at the document's port.
    pub fn new(doc: Arc<Document>, host: &str, stream_set: StreamSet) -> Result<Self> {
        let ctx = Context::new();
        let mut fsm = Fsm::new(doc, host, Party::Client, None, stream_set.clone());

        let thread_ctx = ctx.clone();
        let thread_streams = stream_set.clone();
        let handle = std::thread::Builder::new()
            .name("marionette-dialer".into())
            .spawn(move || {
                match fsm.execute(&thread_ctx) {
                    Ok(()) => debug!("dialer session complete"),
                    Err(Error::Cancelled) => debug!("dialer session cancelled"),
                    Err(e) => error!(error = %e, "dialer session failed"),
                }
                thread_streams.close();
            })
            .map_err(|e| Error::Io(e.to_string()))?;

        Ok(Self { stream_set, ctx, handle: Some(handle) })
    }

    /// Open a fresh stream multiplexed into the session
    pub fn dial(&self) -> Arc<Stream> {
        self.stream_set.create()
    }

    pub fn stream_set(&self) -> &StreamSet {
        &self.stream_set
    }

    /// Cancel the session and wait for the FSM thread to unwind
    pub fn close(&mut self) {
        self.ctx.cancel();
        self.stream_set.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        self.close();
    }
}
