//! Error types shared by the dispatchers and the command service.

use std::os::fd::RawFd;

/// Errors raised by the reactor, the proactor and their callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),

    #[error("descriptor {0} is not registered")]
    NotRegistered(RawFd),

    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("readiness poll failed: {0}")]
    Poll(#[from] nix::errno::Errno),

    #[error("{what} thread panicked")]
    Panicked { what: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
