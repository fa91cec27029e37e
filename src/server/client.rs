//! Line client for a running server.

use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// Connection to a hull server.
pub struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let reader = BufReader::new(stream.try_clone()?);
        debug!(addr = ?stream.peer_addr().ok(), "Connected");
        Ok(Self { stream, reader })
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.stream.set_read_timeout(timeout)?)
    }

    /// Send one command line. The terminator is added here.
    pub fn send(&mut self, line: &str) -> Result<()> {
        let mut out = String::with_capacity(line.len() + 1);
        out.push_str(line);
        out.push('\n');
        self.stream.write_all(out.as_bytes())?;
        Ok(())
    }

    /// Next response line without its terminator, or `None` once the server
    /// closed the connection.
    pub fn recv(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }

    /// Send a command that is answered with exactly one line.
    pub fn request(&mut self, line: &str) -> Result<Option<String>> {
        self.send(line)?;
        self.recv()
    }

    /// Forward `input` line by line and copy every server line to `output`
    /// as it arrives. Returns after `input` is exhausted and the server has
    /// closed its side.
    ///
    /// Server output is read on its own thread, since pending-fill points
    /// get no reply and must not block the next line of input.
    pub fn interactive<R, W>(self, input: R, mut output: W) -> Result<()>
    where
        R: BufRead,
        W: Write + Send + 'static,
    {
        let Client { mut stream, reader } = self;

        let printer = thread::Builder::new()
            .name("client-reader".into())
            .spawn(move || -> std::io::Result<()> {
                for line in reader.lines() {
                    writeln!(output, "{}", line?)?;
                    output.flush()?;
                }
                Ok(())
            })
            .map_err(|source| Error::Spawn {
                what: "client reader",
                source,
            })?;

        for line in input.lines() {
            let mut line = line?;
            line.push('\n');
            stream.write_all(line.as_bytes())?;
        }
        stream.shutdown(Shutdown::Write)?;

        printer
            .join()
            .map_err(|_| Error::Panicked {
                what: "client reader",
            })??;
        Ok(())
    }
}
