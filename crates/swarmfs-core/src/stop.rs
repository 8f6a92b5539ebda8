//! Cooperative cancellation for polling loops.
//!
//! `StopSignal` is a cloneable flag paired with a condition variable, so a
//! loop waiting out its poll interval wakes immediately when the signal is
//! raised instead of finishing the full sleep.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Inner {
    stopped: Mutex<bool>,
    cv: Condvar,
}

/// Cloneable cancellation token shared between a worker and its owner.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

impl StopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every waiter.
    pub fn stop(&self) {
        let mut stopped = self
            .inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        self.inner.cv.notify_all();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self
            .inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait up to `timeout`. Returns `true` if the signal was raised (before
    /// or during the wait), `false` if the full timeout elapsed.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self
            .inner
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .cv
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            stopped = guard;
        }
        true
    }
}

/// Fixed-interval scheduler tick bound to a `StopSignal`.
///
/// The first call to [`Ticker::tick`] returns immediately; later calls wait
/// out the remainder of the interval measured from the previous tick.
#[derive(Debug)]
pub struct Ticker {
    interval: Duration,
    stop: StopSignal,
    last: Option<Instant>,
}

impl Ticker {
    #[must_use]
    pub const fn new(interval: Duration, stop: StopSignal) -> Self {
        Self {
            interval,
            stop,
            last: None,
        }
    }

    /// Block until the next tick. Returns `false` once the signal is raised.
    pub fn tick(&mut self) -> bool {
        if let Some(last) = self.last {
            let remaining = self.interval.saturating_sub(last.elapsed());
            if self.stop.wait_timeout(remaining) {
                return false;
            }
        } else if self.stop.is_stopped() {
            return false;
        }
        self.last = Some(Instant::now());
        true
    }
}
