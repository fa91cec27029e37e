//! Background task that watches the hull area.
//!
//! The monitor sleeps on the graph's condition variable and re-evaluates the
//! hull area whenever a mutation bumps the graph version. It only reports
//! transitions across the threshold; repeated evaluations on the same side
//! stay silent.

use std::sync::PoisonError;
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use super::geometry;
use super::service::{CommandService, GraphState, ThresholdEvent};
use crate::error::{Error, Result};

/// Running monitor thread. Stop it with [`Monitor::shutdown`].
pub struct Monitor {
    service: CommandService,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn spawn(service: CommandService) -> Result<Self> {
        let worker = service.clone();
        // Read before spawning so a mutation racing the thread start is not missed.
        let seen = {
            let mut state = service.lock();
            state.shutdown = false;
            state.version
        };
        let handle = thread::Builder::new()
            .name("hull-monitor".into())
            .spawn(move || run(worker, seen))
            .map_err(|source| Error::Spawn {
                what: "monitor",
                source,
            })?;

        Ok(Self {
            service,
            handle: Some(handle),
        })
    }

    /// Ask the monitor to exit and wait for it.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        {
            let mut state = self.service.lock();
            state.shutdown = true;
            self.service.shared.changed.notify_all();
        }

        handle
            .join()
            .map_err(|_| Error::Panicked { what: "monitor" })
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run(service: CommandService, mut seen: u64) {
    let shared = &service.shared;
    debug!(threshold = shared.threshold, "Hull monitor started");

    loop {
        let guard = service.lock();
        let mut state = shared
            .changed
            .wait_while(guard, |s| s.version == seen && !s.shutdown)
            .unwrap_or_else(PoisonError::into_inner);

        if state.shutdown {
            break;
        }
        seen = state.version;

        if let Some(event) = evaluate(&mut state, shared.threshold) {
            match event {
                ThresholdEvent::Reached { area } => {
                    info!(area, "At least {} units belong to the convex hull", shared.threshold)
                }
                ThresholdEvent::Lost { area } => info!(
                    area,
                    "At least {} units no longer belong to the convex hull", shared.threshold
                ),
            }
            // No subscribers is fine.
            let _ = shared.events.send(event);
        }
    }

    debug!("Hull monitor stopped");
}

/// Compare the current area to the threshold and flip the stored state on a
/// crossing.
fn evaluate(state: &mut GraphState, threshold: f64) -> Option<ThresholdEvent> {
    let area = geometry::hull_area(&state.points);

    match (state.above_threshold, area >= threshold) {
        (false, true) => {
            state.above_threshold = true;
            Some(ThresholdEvent::Reached { area })
        }
        (true, false) => {
            state.above_threshold = false;
            Some(ThresholdEvent::Lost { area })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Point;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::timeout;

    fn square(service: &CommandService, side: f64) {
        service.begin_graph();
        for (x, y) in [(0.0, 0.0), (side, 0.0), (side, side), (0.0, side)] {
            service.fill_point(Point::new(x, y));
        }
        service.finish_graph();
    }

    async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<ThresholdEvent>) -> ThresholdEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timeout waiting for threshold event")
            .expect("event channel closed")
    }

    #[test]
    fn evaluate_is_edge_triggered() {
        let mut state = GraphState::default();
        state.points = vec![
            Point::new(0.0, 0.0),
            Point::new(20.0, 0.0),
            Point::new(0.0, 20.0),
        ];

        assert!(matches!(
            evaluate(&mut state, 100.0),
            Some(ThresholdEvent::Reached { area }) if area == 200.0
        ));
        assert_eq!(evaluate(&mut state, 100.0), None);

        state.points.pop();
        assert!(matches!(
            evaluate(&mut state, 100.0),
            Some(ThresholdEvent::Lost { area }) if area == 0.0
        ));
        assert_eq!(evaluate(&mut state, 100.0), None);
    }

    #[test]
    fn exact_threshold_counts_as_reached() {
        let mut state = GraphState::default();
        state.points = vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ];
        assert!(matches!(
            evaluate(&mut state, 100.0),
            Some(ThresholdEvent::Reached { .. })
        ));
    }

    #[tokio::test]
    async fn emits_one_event_per_crossing() {
        let service = CommandService::default();
        let mut rx = service.subscribe();
        let monitor = Monitor::spawn(service.clone()).unwrap();

        square(&service, 20.0);
        assert!(matches!(next_event(&mut rx).await, ThresholdEvent::Reached { area } if area == 400.0));
        assert!(service.above_threshold());

        // Still above: no new event.
        service.add_point(Point::new(5.0, 5.0));
        service.add_point(Point::new(30.0, 30.0));

        assert!(service.remove_point(Point::new(30.0, 30.0)));
        assert!(service.remove_point(Point::new(20.0, 20.0)));
        assert!(service.remove_point(Point::new(20.0, 0.0)));
        assert!(matches!(next_event(&mut rx).await, ThresholdEvent::Lost { .. }));
        assert!(!service.above_threshold());

        // Still below: no new event.
        service.add_point(Point::new(1.0, 1.0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        monitor.shutdown().unwrap();
    }

    #[tokio::test]
    async fn new_graph_rearms_the_threshold() {
        let service = CommandService::default();
        let mut rx = service.subscribe();
        let monitor = Monitor::spawn(service.clone()).unwrap();

        square(&service, 20.0);
        assert!(matches!(next_event(&mut rx).await, ThresholdEvent::Reached { .. }));

        // Newgraph resets the state silently, so a second large graph is
        // reported again.
        square(&service, 30.0);
        assert!(matches!(next_event(&mut rx).await, ThresholdEvent::Reached { area } if area == 900.0));

        monitor.shutdown().unwrap();
    }

    #[test]
    fn shutdown_joins_idle_monitor() {
        let service = CommandService::default();
        let monitor = Monitor::spawn(service).unwrap();
        monitor.shutdown().unwrap();
    }
}
