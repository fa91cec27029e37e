//! Log output for the `hulld` binary.
//!
//! Everything goes to stderr so that stdout carries nothing but protocol
//! text in `local` mode. Human-readable lines are tagged with the emitting
//! thread (`reactor`, `proactor-worker-N`, `hull-monitor`); `--json-logs`
//! switches to one JSON object per event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Output switches taken from [`AppConfig`](crate::config::AppConfig).
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    /// Log hulld events down to `debug` (connects, disconnects, fills).
    pub verbose: bool,
}

/// Filter used when `RUST_LOG` is unset.
fn default_filter(verbose: bool) -> String {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    format!("hulld={}", level.as_str().to_lowercase())
}

/// Install the global subscriber. Panics if one is already installed, so
/// only `main` calls it.
pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config.verbose)));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_thread_names(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_names(true)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

/// Lets one warning through per interval, shared by every thread that hits
/// the same failure. The proactor's acceptor uses it so a sustained
/// `accept` error (EMFILE under a connection storm) produces one line every
/// few seconds instead of one per retry.
pub struct LogThrottle {
    interval_ms: u64,
    /// Milliseconds since `origin` of the last permitted log, or [`UNSET`].
    last_ms: AtomicU64,
    origin: Instant,
}

const UNSET: u64 = u64::MAX;

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_ms: AtomicU64::new(UNSET),
            origin: Instant::now(),
        }
    }

    /// `true` for the caller that should emit the next warning. Concurrent
    /// callers race on a compare-exchange, so at most one of them wins.
    pub fn should_log(&self) -> bool {
        let now = self.origin.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);

        if last != UNSET && now.saturating_sub(last) < self.interval_ms {
            return false;
        }

        self.last_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn default_filter_targets_hulld() {
        assert_eq!(default_filter(false), "hulld=info");
        assert_eq!(default_filter(true), "hulld=debug");
    }

    #[test]
    fn throttle_allows_first_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
    }

    #[test]
    fn throttle_blocks_immediate_second_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[test]
    fn throttle_allows_log_after_interval() {
        let throttle = LogThrottle::new(Duration::from_millis(20));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
        thread::sleep(Duration::from_millis(40));
        assert!(throttle.should_log());
    }

    #[test]
    fn one_thread_wins_a_simultaneous_burst() {
        let throttle = Arc::new(LogThrottle::new(Duration::from_secs(60)));
        let barrier = Arc::new(Barrier::new(8));

        let winners: usize = (0..8)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    throttle.should_log()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();

        assert_eq!(winners, 1);
    }
}
