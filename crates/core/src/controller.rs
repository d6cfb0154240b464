//! Timestamps for trace events.
use std::sync::OnceLock;
use std::{fmt, sync, time};

/// A monotonic clock with nanosecond resolution.
pub trait ClockSource: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// [`ClockSource`] backed by [`std::time::Instant`], measured from the first
/// time any `MonotonicClock` is read in this process.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl ClockSource for MonotonicClock {
    fn now_ns(&self) -> u64 {
        static EPOCH: OnceLock<time::Instant> = OnceLock::new();
        let epoch = EPOCH.get_or_init(time::Instant::now);
        epoch.elapsed().as_nanos() as u64
    }
}

/// Stamps events for the producer; a thin adapter over a [`ClockSource`].
#[derive(Clone)]
pub struct TracingController {
    clock: sync::Arc<dyn ClockSource>,
}

impl TracingController {
    pub fn new(clock: sync::Arc<dyn ClockSource>) -> Self {
        Self { clock }
    }

    pub fn current_timestamp_microseconds(&self) -> i64 {
        (self.clock.now_ns() / 1000) as i64
    }
}

impl Default for TracingController {
    fn default() -> Self {
        Self::new(sync::Arc::new(MonotonicClock))
    }
}

impl fmt::Debug for TracingController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingController").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic;

    use super::*;

    struct ManualClock(atomic::AtomicU64);

    impl ClockSource for ManualClock {
        fn now_ns(&self) -> u64 {
            self.0.load(atomic::Ordering::Relaxed)
        }
    }

    #[test]
    fn converts_to_microseconds() {
        let clock = sync::Arc::new(ManualClock(atomic::AtomicU64::new(1_999)));
        let controller = TracingController::new(clock.clone());
        assert_eq!(controller.current_timestamp_microseconds(), 1);
        clock.0.store(5_000_000, atomic::Ordering::Relaxed);
        assert_eq!(controller.current_timestamp_microseconds(), 5_000);
    }

    #[test]
    fn monotonic_clock_never_goes_back() {
        let controller = TracingController::default();
        let first = controller.current_timestamp_microseconds();
        let second = controller.current_timestamp_microseconds();
        assert!(second >= first);
    }
}
