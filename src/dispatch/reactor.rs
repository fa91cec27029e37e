//! Readiness reactor.
//!
//! One loop thread multiplexes readiness over every registered descriptor
//! with `poll(2)` and invokes the descriptor's callback. Descriptors are
//! watched for reading by default; [`Reactor::set_interest`] switches a
//! descriptor to writability (or both) while it has output queued.
//!
//! ## Locking
//!
//! The registry has its own mutex. The loop takes it only to snapshot the
//! descriptor set and, after `poll` returns, to clone the callbacks of ready
//! descriptors. Callbacks always run with the lock released, so they may
//! call [`Reactor::register`] and [`Reactor::unregister`] themselves (an
//! accept callback registering its new client, a client callback removing
//! itself on hang-up).
//!
//! The registry owns an `Arc` of every source, and the loop polls a cloned
//! snapshot, so a descriptor cannot be closed and reused while `poll` still
//! refers to it.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, error, trace};

use crate::error::{Error, Result};

/// Upper bound on a single `poll` so the loop notices `stop` promptly.
const POLL_TIMEOUT_MS: u16 = 1000;

/// Sleep between registry checks while nothing is registered.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Readiness bits that dispatch a callback. Hang-ups and errors are
/// delivered too so the callback can observe EOF and clean up.
const READY: PollFlags = PollFlags::POLLIN
    .union(PollFlags::POLLOUT)
    .union(PollFlags::POLLHUP)
    .union(PollFlags::POLLERR);

/// Callback invoked on the loop thread with the ready descriptor.
pub type Callback = Arc<dyn Fn(RawFd) + Send + Sync>;

type Source = Arc<dyn AsFd + Send + Sync>;

struct Registration {
    source: Source,
    callback: Callback,
    interest: PollFlags,
}

struct Inner {
    registry: Mutex<HashMap<RawFd, Registration>>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Poll error that ended the loop, reported by `stop`.
    failure: Mutex<Option<Errno>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            thread: Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<RawFd, Registration>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running reactor. Clones refer to the same instance, which
/// lets callbacks capture a handle and re-enter the registry.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

impl Reactor {
    /// Spawn the loop thread.
    pub fn start() -> Result<Self> {
        let inner = Arc::new(Inner::new());

        let worker = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("reactor".into())
            .spawn(move || run(worker))
            .map_err(|source| Error::Spawn {
                what: "reactor",
                source,
            })?;

        *inner.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        debug!("Reactor started");

        Ok(Self { inner })
    }

    /// Watch `source` for readability. Returns the descriptor the callback
    /// will be invoked with.
    pub fn register<S, F>(&self, source: Arc<S>, callback: F) -> Result<RawFd>
    where
        S: AsFd + Send + Sync + 'static,
        F: Fn(RawFd) + Send + Sync + 'static,
    {
        let fd = source.as_fd().as_raw_fd();

        match self.inner.registry().entry(fd) {
            MapEntry::Occupied(_) => Err(Error::AlreadyRegistered(fd)),
            MapEntry::Vacant(slot) => {
                slot.insert(Registration {
                    source,
                    callback: Arc::new(callback),
                    interest: PollFlags::POLLIN,
                });
                trace!(fd, "Descriptor registered");
                Ok(fd)
            }
        }
    }

    /// Stop watching `fd`. The registry's reference to the source is
    /// dropped, which closes it unless the caller still holds one.
    pub fn unregister(&self, fd: RawFd) -> Result<()> {
        // Dropped outside the lock: the registration may own the last handle
        // to a session.
        let removed = self.inner.registry().remove(&fd);
        match removed {
            Some(_) => {
                trace!(fd, "Descriptor unregistered");
                Ok(())
            }
            None => Err(Error::NotRegistered(fd)),
        }
    }

    /// Replace the readiness `fd` is polled for (`POLLIN`, `POLLOUT` or
    /// both). Takes effect from the next poll round.
    pub fn set_interest(&self, fd: RawFd, interest: PollFlags) -> Result<()> {
        match self.inner.registry().get_mut(&fd) {
            Some(reg) => {
                reg.interest = interest;
                Ok(())
            }
            None => Err(Error::NotRegistered(fd)),
        }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.inner.registry().contains_key(&fd)
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.inner.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// False once `stop` was requested or the loop died on a poll error.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Stop the loop, wait for it to exit and release every registration.
    /// Reports the poll error if the loop had already died on one.
    ///
    /// When called from a callback the loop cannot be joined from its own
    /// thread; it exits as soon as the current dispatch round returns.
    pub fn stop(&self) -> Result<()> {
        self.inner.running.store(false, Ordering::Release);

        let handle = self
            .inner
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let joined = match handle {
            Some(handle) if handle.thread().id() != thread::current().id() => handle
                .join()
                .map_err(|_| Error::Panicked { what: "reactor" }),
            _ => Ok(()),
        };

        // Callbacks commonly capture a handle to this reactor; clearing the
        // registry breaks that cycle.
        let released: Vec<Registration> = self.inner.registry().drain().map(|(_, r)| r).collect();
        drop(released);

        debug!("Reactor stopped");
        joined?;

        match self
            .inner
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(errno) => Err(Error::Poll(errno)),
            None => Ok(()),
        }
    }
}

fn run(inner: Arc<Inner>) {
    while inner.running.load(Ordering::Acquire) {
        let snapshot: Vec<(RawFd, Source, PollFlags)> = inner
            .registry()
            .iter()
            .map(|(fd, reg)| (*fd, Arc::clone(&reg.source), reg.interest))
            .collect();

        if snapshot.is_empty() {
            thread::sleep(IDLE_BACKOFF);
            continue;
        }

        // The snapshot outlives the round, so no descriptor number it holds
        // can be reused by a callback's new registration.
        if !dispatch(&inner, wait_ready(&snapshot)) {
            break;
        }
    }

    inner.running.store(false, Ordering::Release);
}

/// Handle the outcome of one poll round. Returns `false` when the loop must
/// exit.
fn dispatch(inner: &Inner, polled: nix::Result<Vec<RawFd>>) -> bool {
    let ready = match polled {
        Ok(ready) => ready,
        Err(Errno::EINTR) => return true,
        Err(e) => {
            error!(error = %e, "poll failed, reactor loop exiting");
            *inner.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
            inner.running.store(false, Ordering::Release);
            return false;
        }
    };

    for fd in ready {
        let callback = inner.registry().get(&fd).map(|reg| Arc::clone(&reg.callback));

        // Unregistered by an earlier callback in this round.
        if let Some(callback) = callback {
            callback(fd);
        }
    }
    true
}

/// Block up to [`POLL_TIMEOUT_MS`] and return the descriptors that are ready.
fn wait_ready(snapshot: &[(RawFd, Source, PollFlags)]) -> nix::Result<Vec<RawFd>> {
    let mut fds: Vec<PollFd<'_>> = snapshot
        .iter()
        .map(|(_, source, interest)| PollFd::new(source.as_fd(), *interest))
        .collect();

    if poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS))? == 0 {
        return Ok(Vec::new());
    }

    Ok(fds
        .iter()
        .zip(snapshot)
        .filter(|(pfd, _)| pfd.revents().is_some_and(|r| r.intersects(READY)))
        .map(|(_, (fd, _, _))| *fd)
        .collect())
}
