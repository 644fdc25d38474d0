//! Bounded polling with an injectable clock, plus cooperative cancellation.
//!
//! Hardware status registers (PLL done, MCU FIFO empty, ...) are polled
//! through [`BoundedPoll::run`]. The clock is a trait object so tests can
//! simulate "done immediately" or "never done" without real delay.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{LmsError, Result};

/// Time source used by polls and transport retry loops.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant.
    fn now(&self) -> Instant;
    /// Wait for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`Instant::now`] and [`std::thread::sleep`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Simulated clock: `sleep` advances time instantly.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward without sleeping.
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }

    /// Total simulated time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.elapsed.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Default shared clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Cooperative cancellation flag, cheap to clone and share across threads.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create an untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Outcome of one poll iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep<T> {
    /// Condition met; stop polling.
    Ready(T),
    /// Not yet; try again after the interval.
    Pending,
}

/// Budget for a status-register poll: a wall-clock deadline and an
/// iteration cap, whichever is hit first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedPoll {
    /// Deadline measured from the first iteration.
    pub timeout: Duration,
    /// Hard cap on the number of probe calls.
    pub max_iterations: u32,
    /// Delay between probes.
    pub interval: Duration,
}

impl BoundedPoll {
    /// Poll with the given deadline, a 1000-iteration cap and a 1 ms interval.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_iterations: 1000,
            interval: Duration::from_millis(1),
        }
    }

    /// Set the iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Set the delay between probes.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run `probe` until it is ready, fails, the budget runs out, or `cancel` fires.
    ///
    /// `what` names the condition in the timeout message.
    pub fn run<T, F>(
        &self,
        clock: &dyn Clock,
        cancel: Option<&CancellationToken>,
        what: &str,
        mut probe: F,
    ) -> Result<T>
    where
        F: FnMut() -> Result<PollStep<T>>,
    {
        let deadline = clock.now() + self.timeout;
        for iteration in 1..=self.max_iterations {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(LmsError::aborted(format!("cancelled while waiting for {what}")));
            }
            if let PollStep::Ready(value) = probe()? {
                return Ok(value);
            }
            if iteration == self.max_iterations || clock.now() >= deadline {
                break;
            }
            clock.sleep(self.interval);
        }
        Err(LmsError::timeout(format!(
            "{what} not observed within {:?} ({} polls)",
            self.timeout, self.max_iterations
        )))
    }
}
