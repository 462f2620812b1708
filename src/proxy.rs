//! Proxy byte pumps
//!
//! [`ClientProxy`] accepts plain TCP connections on a local bind address
//! and couples each to a fresh multiplexed stream from the dialer.
//! [`ServerProxy`] does the mirror image: it takes remotely-opened streams
//! off a session's stream set and couples each to a fresh TCP connection
//! to the proxy target.

use crate::conn::Context;
use crate::dialer::Dialer;
use crate::error::{Error, Result};
use crate::stream::{Stream, StreamSet};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Local-listener half of the client
pub struct ClientProxy {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    dialer: Arc<Dialer>,
    ctx: Context,
    handle: Option<JoinHandle<()>>,
}

impl ClientProxy {
    pub fn new(listener: TcpListener, dialer: Arc<Dialer>) -> Result<Self> {
        let local_addr = listener.local_addr().map_err(|e| Error::Io(e.to_string()))?;
        listener.set_nonblocking(true).map_err(|e| Error::Io(e.to_string()))?;
        Ok(Self { listener: Some(listener), local_addr, dialer, ctx: Context::new(), handle: None })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting local connections
    pub fn open(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Error::Io("proxy already open".into()))?;
        let dialer = self.dialer.clone();
        let ctx = self.ctx.clone();

        let handle = std::thread::Builder::new()
            .name("marionette-client-proxy".into())
            .spawn(move || accept_loop(listener, dialer, ctx))
            .map_err(|e| Error::Io(e.to_string()))?;
        self.handle = Some(handle);
        Ok(())
    }

    pub fn close(&mut self) {
        self.ctx.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ClientProxy {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(listener: TcpListener, dialer: Arc<Dialer>, ctx: Context) {
    loop {
        if ctx.is_cancelled() {
            return;
        }
        match listener.accept() {
            Ok((sock, peer)) => {
                debug!(peer = %peer, "local connection accepted");
                let stream = dialer.dial();
                couple(sock, stream, ctx.clone());
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "local accept failed");
                return;
            }
        }
    }
}

/// Stream-consumer half of the server: one TCP connection to `target` per
/// remotely-opened stream.
pub struct ServerProxy {
    target: String,
}

impl ServerProxy {
    pub fn new(target: &str) -> Self {
        Self { target: target.into() }
    }

    /// Drain remotely-opened streams until the session ends
    pub fn serve(&self, stream_set: StreamSet, ctx: Context) {
        loop {
            match stream_set.accept(&ctx) {
                Ok(stream) => {
                    debug!(stream = stream.id(), target = %self.target, "proxying stream");
                    match TcpStream::connect(&self.target) {
                        Ok(sock) => couple(sock, stream, ctx.clone()),
                        Err(e) => {
                            warn!(error = %e, target = %self.target, "proxy dial failed");
                            stream.close();
                        }
                    }
                }
                Err(Error::Cancelled | Error::ConnectionClosed) => return,
                Err(e) => {
                    warn!(error = %e, "stream accept failed");
                    return;
                }
            }
        }
    }
}

// Wire a TCP socket and a multiplexed stream together with a pump thread
// per direction.
fn couple(sock: TcpStream, stream: Arc<Stream>, ctx: Context) {
    let reader = match sock.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "socket clone failed");
            stream.close();
            return;
        }
    };

    let inbound_stream = stream.clone();
    let inbound_ctx = ctx.clone();
    let _ = std::thread::Builder::new()
        .name("marionette-pump-in".into())
        .spawn(move || pump_conn_to_stream(reader, inbound_stream, inbound_ctx));

    let _ = std::thread::Builder::new()
        .name("marionette-pump-out".into())
        .spawn(move || pump_stream_to_conn(stream, sock, ctx));
}

fn pump_conn_to_stream(mut sock: TcpStream, stream: Arc<Stream>, ctx: Context) {
    if sock.set_read_timeout(Some(ACCEPT_POLL)).is_err() {
        stream.close_write();
        return;
    }

    let mut buf = [0u8; 8192];
    loop {
        if ctx.is_cancelled() {
            stream.close_write();
            return;
        }
        match sock.read(&mut buf) {
            Ok(0) => {
                stream.close_write();
                return;
            }
            Ok(n) => {
                if stream.write(&buf[..n]).is_err() {
                    return;
                }
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
            Err(_) => {
                stream.close_write();
                return;
            }
        }
    }
}

fn pump_stream_to_conn(stream: Arc<Stream>, mut sock: TcpStream, ctx: Context) {
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf, &ctx) {
            Ok(0) => {
                let _ = sock.shutdown(Shutdown::Write);
                return;
            }
            Ok(n) => {
                if sock.write_all(&buf[..n]).is_err() {
                    stream.close();
                    return;
                }
            }
            Err(_) => {
                let _ = sock.shutdown(Shutdown::Write);
                return;
            }
        }
    }
}
