//! Time keeping for producer loops and bounded waits.
//!
//! Loops never call `thread::sleep` directly: they ask a [`Pacer`] to wait
//! for the next deadline, or poll a [`Deadline`] while waiting for data. Both
//! go through a [`Clock`], so tests can swap in a clock that advances
//! instantly.

use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);

    fn sleep_until(&self, deadline: Instant) {
        let now = self.now();
        if deadline > now {
            self.sleep(deadline - now);
        }
    }
}

/// Wall clock backed by `Instant::now` and `thread::sleep`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Emits evenly spaced deadlines at a nominal rate.
///
/// The first call to [`Pacer::wait`] returns immediately. If the caller falls
/// more than one period behind, the schedule is re-anchored to "now" instead
/// of bursting to catch up.
pub struct Pacer {
    clock: Arc<dyn Clock>,
    period: Duration,
    next: Option<Instant>,
}

impl Pacer {
    pub fn new(clock: Arc<dyn Clock>, period: Duration) -> Self {
        Self {
            clock,
            period,
            next: None,
        }
    }

    pub fn from_rate(clock: Arc<dyn Clock>, rate_hz: f32) -> Self {
        let period = if rate_hz > 0.0 {
            Duration::from_secs_f64(1.0 / f64::from(rate_hz))
        } else {
            Duration::ZERO
        };
        Self::new(clock, period)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn wait(&mut self) -> Instant {
        let now = self.clock.now();
        let deadline = match self.next {
            None => now,
            Some(next) if now > next + self.period => now,
            Some(next) => next,
        };
        self.clock.sleep_until(deadline);
        self.next = Some(deadline + self.period);
        deadline
    }

    pub fn reset(&mut self) {
        self.next = None;
    }
}

/// A point in time after which a bounded wait gives up.
pub struct Deadline<'a> {
    clock: &'a dyn Clock,
    at: Instant,
}

impl<'a> Deadline<'a> {
    pub fn after(clock: &'a dyn Clock, timeout: Duration) -> Self {
        Self {
            at: clock.now() + timeout,
            clock,
        }
    }

    pub fn expired(&self) -> bool {
        self.clock.now() >= self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(self.clock.now())
    }

    /// Sleeps for at most `step`, never past the deadline.
    pub fn pause(&self, step: Duration) {
        self.clock.sleep(step.min(self.remaining()));
    }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use super::Clock;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Clock whose `sleep` advances virtual time immediately.
    pub struct ManualClock {
        origin: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                origin: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            }
        }

        pub fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }

        pub fn elapsed(&self) -> Duration {
            *self.offset.lock().unwrap()
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.origin + *self.offset.lock().unwrap()
        }

        fn sleep(&self, duration: Duration) {
            self.advance(duration);
        }
    }
}
