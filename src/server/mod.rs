//! Convex hull servers.
//!
//! Both variants speak the same line protocol against a shared
//! [`CommandService`]; they differ only in how connections are dispatched.
//!
//! ## Architecture
//!
//! - `protocol`: command parsing, response text and line reassembly
//! - `transport`: per-connection read/respond loops for both dispatchers
//! - `client`: interactive TCP client
//! - `local`: the command language over stdin/stdout

pub mod client;
pub mod local;
pub mod protocol;
mod transport;

use std::net::{SocketAddr, TcpListener};
use std::os::fd::RawFd;

use tracing::info;

use crate::config::Mode;
use crate::core::CommandService;
use crate::dispatch::{Proactor, Reactor};
use crate::error::Result;

pub use client::Client;

/// Single-threaded server: every connection is a reactor callback.
pub struct ReactorServer {
    reactor: Reactor,
    listener_fd: RawFd,
    local_addr: SocketAddr,
}

impl ReactorServer {
    pub fn start(listener: TcpListener, service: CommandService) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let reactor = Reactor::start()?;

        let listener_fd = match transport::register_listener(&reactor, listener, service) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = reactor.stop();
                return Err(e);
            }
        };

        info!(addr = %local_addr, "Reactor server listening");
        Ok(Self {
            reactor,
            listener_fd,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connected clients.
    pub fn connections(&self) -> usize {
        let listening = usize::from(self.reactor.contains(self.listener_fd));
        self.reactor.len().saturating_sub(listening)
    }

    /// Stop the loop and close the listener and every client.
    pub fn stop(&self) -> Result<()> {
        self.reactor.stop()
    }
}

impl Drop for ReactorServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Thread-per-connection server.
pub struct ProactorServer {
    proactor: Proactor,
}

impl ProactorServer {
    pub fn start(listener: TcpListener, service: CommandService) -> Result<Self> {
        let proactor = Proactor::start(listener, move |stream| {
            transport::serve_connection(stream, service.clone())
        })?;

        info!(addr = %proactor.local_addr(), "Proactor server listening");
        Ok(Self { proactor })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.proactor.local_addr()
    }

    pub fn connections(&self) -> usize {
        self.proactor.active_workers()
    }

    pub fn stop(&self) -> Result<()> {
        self.proactor.stop()
    }
}

/// A server of either flavour, chosen at runtime.
pub enum Server {
    Reactor(ReactorServer),
    Proactor(ProactorServer),
}

impl Server {
    /// Bind `addr` and start the server selected by `mode`.
    pub fn bind(mode: Mode, addr: SocketAddr, service: CommandService) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Self::start(mode, listener, service)
    }

    pub fn start(mode: Mode, listener: TcpListener, service: CommandService) -> Result<Self> {
        Ok(match mode {
            Mode::Reactor => Server::Reactor(ReactorServer::start(listener, service)?),
            Mode::Proactor => Server::Proactor(ProactorServer::start(listener, service)?),
        })
    }

    pub fn mode(&self) -> Mode {
        match self {
            Server::Reactor(_) => Mode::Reactor,
            Server::Proactor(_) => Mode::Proactor,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Server::Reactor(s) => s.local_addr(),
            Server::Proactor(s) => s.local_addr(),
        }
    }

    pub fn connections(&self) -> usize {
        match self {
            Server::Reactor(s) => s.connections(),
            Server::Proactor(s) => s.connections(),
        }
    }

    pub fn stop(&self) -> Result<()> {
        match self {
            Server::Reactor(s) => s.stop(),
            Server::Proactor(s) => s.stop(),
        }
    }
}
