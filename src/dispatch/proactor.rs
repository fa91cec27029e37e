//! Thread-per-connection proactor.
//!
//! An acceptor thread blocks on `accept` and hands every connection to a
//! dedicated worker thread. Workers are supervised: each one is recorded in
//! a table together with a clone of its stream, so [`Proactor::stop`] can
//! shut the sockets down and join every worker instead of leaking them.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::logging::LogThrottle;

/// Pause after a failed `accept` so a persistent error (EMFILE) does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Minimum interval between two "accept failed" warnings.
const ACCEPT_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// How long `stop` waits for its wake-up connection to be accepted.
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection handler run on a worker thread. The connection is closed when
/// the handler returns and drops the stream.
pub type Handler = Arc<dyn Fn(TcpStream) + Send + Sync>;

struct Worker {
    /// Clone of the worker's connection, used to unblock it on stop.
    stream: TcpStream,
    handle: JoinHandle<()>,
}

struct Inner {
    running: AtomicBool,
    handler: Handler,
    workers: Mutex<HashMap<u64, Worker>>,
    next_id: AtomicU64,
    failed_accepts: AtomicU64,
    accept_errors: LogThrottle,
}

/// Removes a worker's table entry when its thread ends, including by panic.
struct Deregister {
    inner: Arc<Inner>,
    id: u64,
    peer: SocketAddr,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.inner.workers().remove(&self.id);
        if thread::panicking() {
            warn!(peer = %self.peer, worker = self.id, "Connection handler panicked");
        } else {
            debug!(peer = %self.peer, worker = self.id, "Client disconnected");
        }
    }
}

impl Inner {
    fn workers(&self) -> MutexGuard<'_, HashMap<u64, Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let supervised = match stream.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to clone connection, dropping it");
                return;
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);

        // Held across spawn and insert so a short-lived worker cannot try to
        // remove its entry before it exists.
        let mut workers = self.workers();

        let spawned = thread::Builder::new()
            .name(format!("proactor-worker-{id}"))
            .spawn(move || {
                debug!(peer = %peer, worker = id, "Client connected");
                let handler = Arc::clone(&inner.handler);
                let _entry = Deregister { inner, id, peer };
                handler(stream);
            });

        match spawned {
            Ok(handle) => {
                workers.insert(
                    id,
                    Worker {
                        stream: supervised,
                        handle,
                    },
                );
            }
            // The closure, and the connection it owns, is dropped here.
            Err(e) => error!(peer = %peer, error = %e, "Failed to spawn worker, connection dropped"),
        }
    }

    /// Handle one `accept` outcome. Errors are counted, logged at most once
    /// per interval and followed by a short pause; the acceptor carries on.
    fn on_accept(self: &Arc<Self>, accepted: io::Result<(TcpStream, SocketAddr)>) {
        match accepted {
            Ok((stream, peer)) => self.spawn_worker(stream, peer),
            Err(e) => {
                self.failed_accepts.fetch_add(1, Ordering::Relaxed);
                if self.accept_errors.should_log() {
                    warn!(error = %e, "Failed to accept connection");
                }
                thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }
}

/// Running proactor. Dropping it stops it.
pub struct Proactor {
    inner: Arc<Inner>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    local_addr: SocketAddr,
}

impl Proactor {
    /// Take ownership of a bound listener and start accepting on it.
    pub fn start<F>(listener: TcpListener, handler: F) -> Result<Self>
    where
        F: Fn(TcpStream) + Send + Sync + 'static,
    {
        let local_addr = listener.local_addr()?;
        // The listener may have been used in non-blocking mode elsewhere.
        listener.set_nonblocking(false)?;

        let inner = Arc::new(Inner {
            running: AtomicBool::new(true),
            handler: Arc::new(handler),
            workers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            failed_accepts: AtomicU64::new(0),
            accept_errors: LogThrottle::new(ACCEPT_ERROR_LOG_INTERVAL),
        });

        let acceptor = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("proactor-accept".into())
            .spawn(move || accept_loop(listener, acceptor))
            .map_err(|source| Error::Spawn {
                what: "proactor acceptor",
                source,
            })?;

        debug!(addr = %local_addr, "Proactor started");

        Ok(Self {
            inner,
            acceptor: Mutex::new(Some(handle)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections currently being served.
    pub fn active_workers(&self) -> usize {
        self.inner.workers().len()
    }

    /// Number of `accept` calls that have failed since start.
    pub fn failed_accepts(&self) -> u64 {
        self.inner.failed_accepts.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Stop accepting, close every live connection and join all threads.
    pub fn stop(&self) -> Result<()> {
        let Some(acceptor) = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        self.inner.running.store(false, Ordering::Release);

        // Unblock `accept`; the acceptor sees the cleared flag and exits.
        if let Err(e) = TcpStream::connect_timeout(&wake_addr(self.local_addr), WAKE_TIMEOUT) {
            warn!(addr = %self.local_addr, error = %e, "Failed to wake acceptor");
        }

        let mut result = acceptor.join().map_err(|_| Error::Panicked {
            what: "proactor acceptor",
        });

        let workers: Vec<Worker> = self.inner.workers().drain().map(|(_, w)| w).collect();
        let count = workers.len();

        for worker in &workers {
            if let Err(e) = worker.stream.shutdown(Shutdown::Both) {
                // Already closed by the peer.
                if e.kind() != io::ErrorKind::NotConnected {
                    debug!(error = %e, "Failed to shut down worker connection");
                }
            }
        }

        for worker in workers {
            // A handler stopping its own proactor cannot join itself.
            if worker.handle.thread().id() == thread::current().id() {
                continue;
            }
            if worker.handle.join().is_err() {
                warn!("Proactor worker panicked");
                result = result.and(Err(Error::Panicked {
                    what: "proactor worker",
                }));
            }
        }

        info!(addr = %self.local_addr, workers = count, "Proactor stopped");
        result
    }
}

impl Drop for Proactor {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn accept_loop(listener: TcpListener, inner: Arc<Inner>) {
    loop {
        let accepted = listener.accept();

        if !inner.running.load(Ordering::Acquire) {
            break;
        }

        inner.on_accept(accepted);
    }

    debug!("Proactor acceptor exiting");
}

/// Address `stop` connects to. A wildcard bind is reached over loopback.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}
