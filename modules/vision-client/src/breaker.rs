use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::types::VisionError;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Failures further apart than this do not count as consecutive.
    pub failure_window: Duration,
    /// How long the breaker stays open before allowing a half-open trial.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker for one external dependency.
///
/// An explicit, injectable instance — never an ambient singleton — so tests
/// run isolated breakers in parallel. The closed-state hot path is a single
/// atomic load; the mutex guards only transition bookkeeping, which sits on
/// the failure path or behind an already-open breaker.
pub struct CircuitBreaker {
    state: AtomicU8,
    config: BreakerConfig,
    inner: Mutex<Tracking>,
}

#[derive(Debug, Default)]
struct Tracking {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    open_deadline: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CLOSED),
            config,
            inner: Mutex::new(Tracking::default()),
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            CLOSED => BreakerState::Closed,
            OPEN => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }

    /// Gate a call. `Ok(())` means the caller may proceed and must report the
    /// outcome via [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn try_acquire(&self) -> Result<(), VisionError> {
        if self.state.load(Ordering::Acquire) == CLOSED {
            return Ok(());
        }
        self.try_acquire_slow()
    }

    fn try_acquire_slow(&self) -> Result<(), VisionError> {
        let mut t = self.inner.lock().expect("breaker lock poisoned");
        match self.state.load(Ordering::Acquire) {
            CLOSED => Ok(()),
            OPEN => {
                let cooled_down = t.open_deadline.is_none_or(|d| Instant::now() >= d);
                if cooled_down {
                    // Cooldown elapsed: allow exactly one trial call.
                    self.state.store(HALF_OPEN, Ordering::Release);
                    t.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(VisionError::CircuitOpen)
                }
            }
            _ => {
                // Half-open: one trial at a time.
                if t.trial_in_flight {
                    Err(VisionError::CircuitOpen)
                } else {
                    t.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut t = self.inner.lock().expect("breaker lock poisoned");
        t.consecutive_failures = 0;
        t.last_failure = None;
        t.open_deadline = None;
        t.trial_in_flight = false;
        self.state.store(CLOSED, Ordering::Release);
    }

    pub fn record_failure(&self) {
        let mut t = self.inner.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        match self.state.load(Ordering::Acquire) {
            HALF_OPEN => {
                // Trial failed: reopen and restart the cooldown.
                warn!("vision breaker trial call failed, reopening");
                self.open_locked(&mut t, now);
            }
            OPEN => {
                t.last_failure = Some(now);
            }
            _ => {
                // Only failures inside the window count as consecutive.
                if t.last_failure
                    .is_some_and(|prev| now.duration_since(prev) > self.config.failure_window)
                {
                    t.consecutive_failures = 0;
                }
                t.last_failure = Some(now);
                t.consecutive_failures += 1;
                if t.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = t.consecutive_failures,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "vision breaker opening"
                    );
                    self.open_locked(&mut t, now);
                }
            }
        }
    }

    fn open_locked(&self, t: &mut Tracking, now: Instant) {
        t.open_deadline = Some(now + self.config.cooldown);
        t.trial_in_flight = false;
        t.last_failure = Some(now);
        self.state.store(OPEN, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            failure_window: Duration::from_secs(60),
            cooldown,
        })
    }

    #[test]
    fn opens_after_exactly_n_failures() {
        let b = breaker(3, Duration::from_secs(30));
        for _ in 0..2 {
            b.try_acquire().unwrap();
            b.record_failure();
            assert_eq!(b.state(), BreakerState::Closed);
        }
        b.try_acquire().unwrap();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(matches!(b.try_acquire(), Err(VisionError::CircuitOpen)));
    }

    #[test]
    fn success_resets_consecutive_count() {
        let b = breaker(3, Duration::from_secs(30));
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_allows_single_trial() {
        let b = breaker(1, Duration::from_millis(10));
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(20));
        b.try_acquire().unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Second concurrent acquirer is rejected while the trial is in flight.
        assert!(matches!(b.try_acquire(), Err(VisionError::CircuitOpen)));
    }

    #[test]
    fn trial_success_closes() {
        let b = breaker(1, Duration::from_millis(10));
        b.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        b.try_acquire().unwrap();
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        b.try_acquire().unwrap();
    }

    #[test]
    fn trial_failure_reopens_with_fresh_cooldown() {
        let b = breaker(1, Duration::from_millis(30));
        b.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        b.try_acquire().unwrap();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        // Immediately after reopening the cooldown has not elapsed.
        assert!(matches!(b.try_acquire(), Err(VisionError::CircuitOpen)));
    }

    #[test]
    fn stale_failures_do_not_accumulate() {
        let b = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 2,
            failure_window: Duration::from_millis(20),
            cooldown: Duration::from_secs(30),
        });
        b.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        // Outside the window: the count restarts at one, not two.
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
