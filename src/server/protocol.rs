//! Line protocol spoken by every server variant.
//!
//! Requests and responses are single ASCII lines terminated by `\n`:
//!
//! ```text
//! Newgraph 3        -> Ready to receive 3 points. Send them as x,y format:
//! 0,0
//! 10,0
//! 0,10              -> Graph created with 3 points
//! Newpoint 10,10    -> Point added
//! Removepoint 0,0   -> Point removed
//! CH                -> 50.000000
//! ```

use std::fmt;
use std::io::{self, Write};

use crate::core::Point;

/// Longest line accepted before the connection's buffer is discarded.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// A command in the idle (non pending-fill) state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    NewGraph(i64),
    NewPoint(Point),
    RemovePoint(Point),
    ConvexHull,
}

/// Why a line could not be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Unknown command")]
    UnknownCommand,
    #[error("Invalid point format")]
    InvalidPoint,
    #[error("Invalid Newgraph command format")]
    InvalidNewGraph,
    #[error("Line too long")]
    LineTooLong,
}

impl Command {
    /// Parse one line received outside of pending-fill.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (line, ""),
        };

        match keyword {
            "Newgraph" => rest
                .split_whitespace()
                .next()
                .and_then(|n| n.parse::<i64>().ok())
                .map(Command::NewGraph)
                .ok_or(ParseError::InvalidNewGraph),
            "Newpoint" => parse_point(rest).map(Command::NewPoint),
            "Removepoint" => parse_point(rest).map(Command::RemovePoint),
            "CH" => Ok(Command::ConvexHull),
            _ => Err(ParseError::UnknownCommand),
        }
    }
}

/// Parse `x,y`. Whitespace around either coordinate is tolerated; NaN and
/// infinities are not.
pub fn parse_point(text: &str) -> Result<Point, ParseError> {
    let (x, y) = text.split_once(',').ok_or(ParseError::InvalidPoint)?;
    let x: f64 = x.trim().parse().map_err(|_| ParseError::InvalidPoint)?;
    let y: f64 = y.trim().parse().map_err(|_| ParseError::InvalidPoint)?;

    if !x.is_finite() || !y.is_finite() {
        return Err(ParseError::InvalidPoint);
    }
    Ok(Point::new(x, y))
}

/// A single response line.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    AwaitingPoints(usize),
    EmptyGraph,
    GraphCreated(usize),
    PointAdded,
    PointRemoved,
    PointNotFound,
    Area(f64),
    Error(ParseError),
}

impl Response {
    /// Write the response followed by its `\n` terminator.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(writer, "{}", self)
    }
}

impl From<ParseError> for Response {
    fn from(err: ParseError) -> Self {
        Response::Error(err)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::AwaitingPoints(n) => {
                write!(f, "Ready to receive {} points. Send them as x,y format:", n)
            }
            Response::EmptyGraph => f.write_str("Empty graph created"),
            Response::GraphCreated(n) => write!(f, "Graph created with {} points", n),
            Response::PointAdded => f.write_str("Point added"),
            Response::PointRemoved => f.write_str("Point removed"),
            Response::PointNotFound => f.write_str("Point not found"),
            Response::Area(area) => write!(f, "{:.6}", area),
            Response::Error(err) => write!(f, "ERROR: {}", err),
        }
    }
}

/// Reassembles newline-delimited lines from arbitrarily split reads.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Set while discarding the remainder of an overlong line.
    overflowed: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered without a terminating newline yet.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete line, with `\n` and a trailing `\r` removed.
    pub fn next_line(&mut self) -> Option<Result<String, ParseError>> {
        let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
            if self.buf.len() > MAX_LINE_LEN {
                self.buf.clear();
                self.overflowed = true;
            }
            return None;
        };

        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        if std::mem::take(&mut self.overflowed) || line.len() > MAX_LINE_LEN {
            return Some(Err(ParseError::LineTooLong));
        }
        Some(Ok(String::from_utf8_lossy(&line).into_owned()))
    }
}
