//! TCP transport for both dispatchers.
//!
//! Bytes read from a connection are fed to that connection's [`Session`].
//! Each connection is handled by exactly one thread at a time, so responses
//! stay in request order.
//!
//! Proactor workers own their thread and write responses with a blocking
//! `write_all` before the next read. Reactor connections share the loop
//! thread, so their sockets are non-blocking: responses go to a per-connection
//! outbox that is flushed as the socket accepts it, and a connection whose
//! outbox reaches [`MAX_PENDING_OUTPUT`] is not read again until the peer
//! drains it.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, PoisonError};

use nix::poll::PollFlags;
use tracing::{debug, trace, warn};

use super::protocol::Response;
use crate::core::{CommandService, Session};
use crate::dispatch::Reactor;
use crate::error::Result;

/// Bytes requested per `read`.
const READ_BUF_LEN: usize = 1024;

/// Queued response bytes at which a reactor connection stops being read.
pub const MAX_PENDING_OUTPUT: usize = 64 * 1024;

/// Write every response in a single `write_all`.
fn write_responses<W: Write>(mut writer: W, responses: &[Response]) -> io::Result<()> {
    if responses.is_empty() {
        return Ok(());
    }

    let mut out = Vec::with_capacity(responses.len() * 32);
    for response in responses {
        response.write_to(&mut out)?;
    }
    writer.write_all(&out)?;
    writer.flush()
}

/// Serve one connection to completion on the calling thread. Used as the
/// proactor's worker body.
pub(crate) fn serve_connection(stream: TcpStream, service: CommandService) {
    let peer = stream.peer_addr().ok();
    let mut session = Session::new(service);
    let mut buf = [0u8; READ_BUF_LEN];

    loop {
        let n = match (&stream).read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(peer = ?peer, error = %e, "Connection error");
                break;
            }
        };

        let responses = session.receive(&buf[..n]);
        if let Err(e) = write_responses(&stream, &responses) {
            debug!(peer = ?peer, error = %e, "Failed to write response");
            break;
        }
    }
}

/// Register `listener` with the reactor. Every accepted client is
/// registered in turn from within the accept callback.
pub(crate) fn register_listener(
    reactor: &Reactor,
    listener: TcpListener,
    service: CommandService,
) -> Result<RawFd> {
    // Readiness may be stale by the time the callback runs; never block the loop.
    listener.set_nonblocking(true)?;

    let listener = Arc::new(listener);
    let accepting = Arc::clone(&listener);
    let handle = reactor.clone();

    reactor.register(listener, move |_| loop {
        match accepting.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = register_client(&handle, stream, peer, service.clone()) {
                    warn!(peer = %peer, error = %e, "Failed to register client");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                break;
            }
        }
    })
}

/// Reactor-side state of one client.
struct Connection {
    session: Session,
    outbox: Vec<u8>,
    eof: bool,
}

impl Connection {
    fn new(service: CommandService) -> Self {
        Self {
            session: Session::new(service),
            outbox: Vec::new(),
            eof: false,
        }
    }

    /// Write queued output until it is gone or the socket would block.
    fn flush<W: Write>(&mut self, mut writer: W) -> io::Result<()> {
        let mut written = 0;
        let result = loop {
            if written == self.outbox.len() {
                break Ok(());
            }
            match writer.write(&self.outbox[written..]) {
                Ok(0) => break Err(ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.outbox.drain(..written);
        result
    }

    /// Flush, then read once unless the outbox is full or the peer has
    /// finished sending. Returns `Ok(false)` once the connection is done.
    fn on_ready<S: Read + Write>(&mut self, mut stream: S) -> io::Result<bool> {
        self.flush(&mut stream)?;

        if !self.eof && self.outbox.len() < MAX_PENDING_OUTPUT {
            let mut buf = [0u8; READ_BUF_LEN];
            match stream.read(&mut buf) {
                Ok(0) => self.eof = true,
                Ok(n) => {
                    for response in self.session.receive(&buf[..n]) {
                        response.write_to(&mut self.outbox)?;
                    }
                    self.flush(&mut stream)?;
                }
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
                Err(e) => return Err(e),
            }
        }

        // Responses to a half-closed peer are still delivered.
        Ok(!(self.eof && self.outbox.is_empty()))
    }

    fn interest(&self) -> PollFlags {
        if self.eof || self.outbox.len() >= MAX_PENDING_OUTPUT {
            PollFlags::POLLOUT
        } else if self.outbox.is_empty() {
            PollFlags::POLLIN
        } else {
            PollFlags::POLLIN | PollFlags::POLLOUT
        }
    }
}

fn register_client(
    reactor: &Reactor,
    stream: TcpStream,
    peer: SocketAddr,
    service: CommandService,
) -> Result<()> {
    // Accepted sockets do not inherit the listener's non-blocking flag on
    // every platform.
    stream.set_nonblocking(true)?;

    let stream = Arc::new(stream);
    let conn = Arc::clone(&stream);
    let state = Mutex::new(Connection::new(service));
    let handle = reactor.clone();

    let fd = reactor.register(stream, move |fd| {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);

        match state.on_ready(&*conn) {
            Ok(true) => {
                trace!(fd, pending = state.outbox.len(), "Connection serviced");
                let _ = handle.set_interest(fd, state.interest());
            }
            Ok(false) => {
                debug!(peer = %peer, fd, "Client disconnected");
                let _ = handle.unregister(fd);
            }
            Err(e) => {
                debug!(peer = %peer, fd, error = %e, "Connection error");
                let _ = handle.unregister(fd);
            }
        }
    })?;

    debug!(peer = %peer, fd, "Client connected");
    Ok(())
}
