//! Server-side listener
//!
//! Accepts TCP connections on the bind address and gives each one its own
//! stream set and PFSM, running on dedicated threads. Remotely-opened
//! streams are drained by a [`ServerProxy`] into fresh connections to the
//! proxy target.

use crate::conn::{BufferedConn, Context};
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::mar::{Document, Party};
use crate::proxy::ServerProxy;
use crate::stream::StreamSet;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Accept loop: one PFSM per accepted connection
pub struct Listener {
    local_addr: SocketAddr,
    ctx: Context,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind `addr` and start serving `doc`, proxying application streams to
    /// `proxy_target`.
    pub fn new(doc: Arc<Document>, addr: &str, proxy_target: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| Error::Io(e.to_string()))?;
        listener.set_nonblocking(true).map_err(|e| Error::Io(e.to_string()))?;
        let local_addr = listener.local_addr().map_err(|e| Error::Io(e.to_string()))?;

        let host = local_addr.ip().to_string();
        let target = proxy_target.to_string();
        let ctx = Context::new();
        let thread_ctx = ctx.clone();

        let handle = std::thread::Builder::new()
            .name("marionette-listener".into())
            .spawn(move || accept_loop(listener, doc, host, target, thread_ctx))
            .map_err(|e| Error::Io(e.to_string()))?;

        Ok(Self { local_addr, ctx, handle: Some(handle) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&mut self) {
        self.ctx.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(listener: TcpListener, doc: Arc<Document>, host: String, target: String, ctx: Context) {
    loop {
        if ctx.is_cancelled() {
            return;
        }
        match listener.accept() {
            Ok((sock, peer)) => {
                debug!(peer = %peer, "connection accepted");
                if let Err(e) = sock.set_nonblocking(false) {
                    warn!(error = %e, "socket setup failed");
                    continue;
                }
                spawn_session(doc.clone(), sock, &host, &target, ctx.clone());
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        }
    }
}

// A session is one PFSM thread plus one proxy pump draining its streams.
fn spawn_session(doc: Arc<Document>, sock: TcpStream, host: &str, target: &str, ctx: Context) {
    let stream_set = StreamSet::new();
    let mut fsm = Fsm::new(
        doc,
        host,
        Party::Server,
        Some(BufferedConn::new(sock)),
        stream_set.clone(),
    );

    let proxy = ServerProxy::new(target);
    let proxy_streams = stream_set.clone();
    let proxy_ctx = ctx.clone();
    let _ = std::thread::Builder::new()
        .name("marionette-server-proxy".into())
        .spawn(move || proxy.serve(proxy_streams, proxy_ctx));

    let _ = std::thread::Builder::new()
        .name("marionette-session".into())
        .spawn(move || {
            match fsm.execute(&ctx) {
                Ok(()) => debug!("session complete"),
                Err(Error::Cancelled) => debug!("session cancelled"),
                Err(e) => error!(error = %e, "session failed"),
            }
            stream_set.close();
        });
}
