//! The shared graph and the lock discipline around it.
//!
//! All connections, whichever dispatcher serves them, mutate one point set
//! through [`CommandService`]. Every access holds the graph mutex for the
//! whole operation. Mutations that the threshold monitor must see bump
//! [`GraphState::version`] and notify the condition variable *before* the
//! guard is released, so the monitor can never evaluate a graph older than
//! the signal it woke up for.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::debug;

use super::geometry::{self, Point};

/// Hull area at or above which the graph counts as "large".
pub const DEFAULT_AREA_THRESHOLD: f64 = 100.0;

/// Capacity of the threshold event fan-out channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Edge-triggered notification raised by the monitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdEvent {
    /// Area went from below the threshold to at or above it.
    Reached { area: f64 },
    /// Area went from at or above the threshold to below it.
    Lost { area: f64 },
}

/// Everything guarded by the graph mutex.
#[derive(Debug, Default)]
pub struct GraphState {
    pub(crate) points: Vec<Point>,
    /// Result of the monitor's last evaluation.
    pub(crate) above_threshold: bool,
    /// Bumped by every mutation the monitor must re-evaluate.
    pub(crate) version: u64,
    pub(crate) shutdown: bool,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<GraphState>,
    pub(crate) changed: Condvar,
    pub(crate) events: broadcast::Sender<ThresholdEvent>,
    pub(crate) threshold: f64,
}

/// Handle to the shared graph. Cheap to clone; every clone sees the same
/// state.
#[derive(Clone)]
pub struct CommandService {
    pub(crate) shared: Arc<Shared>,
}

impl Default for CommandService {
    fn default() -> Self {
        Self::new(DEFAULT_AREA_THRESHOLD)
    }
}

impl CommandService {
    pub fn new(threshold: f64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(GraphState::default()),
                changed: Condvar::new(),
                events,
                threshold,
            }),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.shared.threshold
    }

    /// Receive every threshold event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ThresholdEvent> {
        self.shared.events.subscribe()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, GraphState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the graph as changed. Must be called with the guard still held.
    fn signal(&self, state: &mut GraphState) {
        state.version = state.version.wrapping_add(1);
        self.shared.changed.notify_one();
    }

    /// `Newgraph`: clear the graph and forget the threshold state.
    pub fn begin_graph(&self) {
        let mut state = self.lock();
        state.points.clear();
        state.above_threshold = false;
        debug!("Graph cleared");
    }

    /// Append one point received during pending-fill. The monitor is not
    /// woken until [`finish_graph`](Self::finish_graph).
    pub fn fill_point(&self, point: Point) -> usize {
        let mut state = self.lock();
        state.points.push(point);
        state.points.len()
    }

    /// End a pending-fill (complete or aborted) and wake the monitor.
    pub fn finish_graph(&self) -> usize {
        let mut state = self.lock();
        self.signal(&mut state);
        state.points.len()
    }

    /// `Newpoint`.
    pub fn add_point(&self, point: Point) -> usize {
        let mut state = self.lock();
        state.points.push(point);
        self.signal(&mut state);
        state.points.len()
    }

    /// `Removepoint`: remove the first point equal to `point` within the
    /// epsilon. Returns whether anything was removed.
    pub fn remove_point(&self, point: Point) -> bool {
        let mut state = self.lock();
        let Some(idx) = state.points.iter().position(|p| p.approx_eq(&point)) else {
            return false;
        };

        state.points.remove(idx);
        self.signal(&mut state);
        true
    }

    /// `CH`: area of the current convex hull.
    pub fn hull_area(&self) -> f64 {
        let state = self.lock();
        geometry::hull_area(&state.points)
    }

    pub fn hull(&self) -> Vec<Point> {
        let state = self.lock();
        geometry::convex_hull(&state.points)
    }

    pub fn len(&self) -> usize {
        self.lock().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current point set.
    pub fn points(&self) -> Vec<Point> {
        self.lock().points.clone()
    }

    /// Threshold state as last evaluated by the monitor.
    pub fn above_threshold(&self) -> bool {
        self.lock().above_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn add_and_remove_points() {
        let service = CommandService::default();
        assert!(service.is_empty());

        assert_eq!(service.add_point(Point::new(1.0, 1.0)), 1);
        assert_eq!(service.add_point(Point::new(1.0, 1.0)), 2);
        assert!(service.remove_point(Point::new(1.0, 1.0 + 1e-12)));
        assert_eq!(service.len(), 1);
        assert!(!service.remove_point(Point::new(2.0, 2.0)));
    }

    #[test]
    fn mutations_bump_version() {
        let service = CommandService::default();
        let version = || service.lock().version;

        service.add_point(Point::new(0.0, 0.0));
        assert_eq!(version(), 1);

        service.remove_point(Point::new(5.0, 5.0));
        assert_eq!(version(), 1, "a miss is not a mutation");

        service.begin_graph();
        service.fill_point(Point::new(1.0, 1.0));
        assert_eq!(version(), 1);
        assert_eq!(service.finish_graph(), 1);
        assert_eq!(version(), 2);
    }

    #[test]
    fn begin_graph_resets_threshold_state() {
        let service = CommandService::default();
        service.lock().above_threshold = true;
        service.add_point(Point::new(0.0, 0.0));

        service.begin_graph();
        assert!(service.is_empty());
        assert!(!service.above_threshold());
    }

    #[test]
    fn concurrent_mutations_are_not_lost() {
        let service = CommandService::default();
        for i in 0..100 {
            service.add_point(Point::new(i as f64, 0.0));
        }

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let service = service.clone();
                thread::spawn(move || {
                    let mut removed = 0;
                    for i in 0..200 {
                        service.add_point(Point::new(1000.0 + t as f64, i as f64));
                        if i < 10 && service.remove_point(Point::new((t * 10 + i) as f64, 0.0)) {
                            removed += 1;
                        }
                    }
                    removed
                })
            })
            .collect();

        let removed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(removed, 80);
        assert_eq!(service.len(), 100 + 8 * 200 - removed);
    }

    #[test]
    fn hull_area_of_square() {
        let service = CommandService::default();
        for (x, y) in [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0), (5.0, 5.0)] {
            service.add_point(Point::new(x, y));
        }
        assert_eq!(service.hull_area(), 100.0);
        assert_eq!(service.hull().len(), 4);
    }
}
