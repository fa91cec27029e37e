//! Per-connection command state.
//!
//! A [`Session`] owns the receive buffer and the pending-fill sub-state of
//! one client. It is driven by exactly one thread at a time (a proactor
//! worker or the reactor loop) and is never shared.

use tracing::{debug, warn};

use super::service::CommandService;
use crate::server::protocol::{Command, LineBuffer, ParseError, Response, parse_point};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FillState {
    Idle,
    /// After `Newgraph n`: the next `remaining` lines are points.
    Pending { remaining: usize },
}

pub struct Session {
    service: CommandService,
    lines: LineBuffer,
    fill: FillState,
}

impl Session {
    pub fn new(service: CommandService) -> Self {
        Self {
            service,
            lines: LineBuffer::new(),
            fill: FillState::Idle,
        }
    }

    /// Whether the session is still waiting for `Newgraph` points.
    pub fn is_filling(&self) -> bool {
        matches!(self.fill, FillState::Pending { .. })
    }

    /// Points still expected by the current pending-fill.
    pub fn points_remaining(&self) -> usize {
        match self.fill {
            FillState::Pending { remaining } => remaining,
            FillState::Idle => 0,
        }
    }

    /// Feed raw bytes from the socket and handle every completed line.
    pub fn receive(&mut self, bytes: &[u8]) -> Vec<Response> {
        self.lines.extend(bytes);

        let mut responses = Vec::new();
        while let Some(line) = self.lines.next_line() {
            let response = match line {
                Ok(line) => self.handle_line(&line),
                Err(err) => Some(self.reject(err)),
            };
            responses.extend(response);
        }
        responses
    }

    /// Handle one line without its terminator. Returns `None` for lines that
    /// are silently accepted (blank lines and all but the last fill point).
    pub fn handle_line(&mut self, line: &str) -> Option<Response> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        match self.fill {
            FillState::Pending { remaining } => self.fill_point(line, remaining),
            FillState::Idle => Some(self.dispatch(line)),
        }
    }

    fn fill_point(&mut self, line: &str, remaining: usize) -> Option<Response> {
        let point = match parse_point(line) {
            Ok(point) => point,
            Err(err) => return Some(self.reject(err)),
        };

        self.service.fill_point(point);

        if remaining > 1 {
            self.fill = FillState::Pending {
                remaining: remaining - 1,
            };
            return None;
        }

        self.fill = FillState::Idle;
        let size = self.service.finish_graph();
        debug!(size, "Graph filled");
        Some(Response::GraphCreated(size))
    }

    fn dispatch(&mut self, line: &str) -> Response {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(err) => return self.reject(err),
        };

        match command {
            Command::NewGraph(n) if n > 0 => {
                let expected = usize::try_from(n).unwrap_or(usize::MAX);
                self.service.begin_graph();
                self.fill = FillState::Pending {
                    remaining: expected,
                };
                Response::AwaitingPoints(expected)
            }
            Command::NewGraph(_) => {
                self.service.begin_graph();
                self.service.finish_graph();
                Response::EmptyGraph
            }
            Command::NewPoint(point) => {
                self.service.add_point(point);
                Response::PointAdded
            }
            Command::RemovePoint(point) => {
                if self.service.remove_point(point) {
                    Response::PointRemoved
                } else {
                    Response::PointNotFound
                }
            }
            Command::ConvexHull => Response::Area(self.service.hull_area()),
        }
    }

    /// Turn a protocol error into a response. A malformed line during
    /// pending-fill ends the fill with whatever points arrived so far.
    fn reject(&mut self, err: ParseError) -> Response {
        if let FillState::Pending { remaining } = self.fill {
            self.fill = FillState::Idle;
            let size = self.service.finish_graph();
            warn!(remaining, size, error = %err, "Graph fill aborted");
        }
        err.into()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let FillState::Pending { remaining } = self.fill {
            let size = self.service.finish_graph();
            warn!(remaining, size, "Connection closed during graph fill");
        }
    }
}
