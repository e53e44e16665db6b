//! Bounded waiting primitives.
//!
//! Every wait in the workflow is expressed through these types: a [`Clock`]
//! so tests can run without real sleeps, a [`CancelToken`] observed by every
//! loop, and the two policies describing how long to wait and how often to
//! retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Source of time for poll loops and backoffs.
pub trait Clock {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Longest uninterrupted sleep taken by a [`SystemClock`] with a token.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// The wall clock.
///
/// With a [`CancelToken`] attached, sleeps are taken in short slices and end
/// early once the token is raised; the caller's next `check` then reports the
/// cancellation.
#[derive(Debug, Default, Clone)]
pub struct SystemClock {
    cancel: Option<CancelToken>,
}

impl SystemClock {
    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self {
            cancel: Some(cancel),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        let Some(cancel) = &self.cancel else {
            std::thread::sleep(duration);
            return;
        };
        let deadline = Instant::now() + duration;
        while !cancel.is_cancelled() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }
}

/// Shared flag raised when the operator interrupts the run.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Cancelled`] if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Retry budget for operations whose failures may be transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never less than 1.
    pub max_attempts: u32,
    /// Pause between a failed attempt and the next one.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Create a retry policy. `max_attempts` of zero is treated as one.
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}

/// Fixed-interval poll with a hard deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Pause between two observations.
    pub interval: Duration,
    /// Total time allowed before giving up.
    pub timeout: Duration,
    /// Extra wait after the awaited condition is first observed.
    pub settle: Duration,
}

impl PollPolicy {
    /// Create a poll policy.
    pub fn new(interval: Duration, timeout: Duration, settle: Duration) -> Self {
        Self {
            interval,
            timeout,
            settle,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(3),
            Duration::from_secs(180),
            Duration::from_secs(20),
        )
    }
}

/// Outcome of [`poll_until`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The probe produced a value before the deadline.
    Ready(T),
    /// The deadline passed; carries the number of probes issued.
    Expired { polls: u32 },
}

/// Sleep `interval`, probe, repeat until the probe yields `Some` or the
/// deadline passes.
///
/// The last sleep is clipped to the deadline, so a probe may run exactly at
/// the deadline but never after it. Cancellation is checked before every
/// sleep and every probe.
pub fn poll_until<T, F>(
    clock: &dyn Clock,
    cancel: &CancelToken,
    policy: &PollPolicy,
    mut probe: F,
) -> Result<PollOutcome<T>>
where
    F: FnMut() -> Result<Option<T>>,
{
    let deadline = clock.now() + policy.timeout;
    let mut polls = 0u32;

    loop {
        cancel.check()?;
        let remaining = deadline.saturating_duration_since(clock.now());
        if remaining.is_zero() {
            return Ok(PollOutcome::Expired { polls });
        }

        clock.sleep(policy.interval.min(remaining));
        cancel.check()?;
        if clock.now() > deadline {
            return Ok(PollOutcome::Expired { polls });
        }

        polls += 1;
        if let Some(value) = probe()? {
            return Ok(PollOutcome::Ready(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct StepClock {
        base: Instant,
        offset: Cell<Duration>,
    }

    impl StepClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Cell::new(Duration::ZERO),
            }
        }
    }

    impl Clock for StepClock {
        fn now(&self) -> Instant {
            self.base + self.offset.get()
        }

        fn sleep(&self, duration: Duration) {
            self.offset.set(self.offset.get() + duration);
        }
    }

    #[test]
    fn test_retry_policy_clamps_attempts() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 1);
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff, Duration::from_secs(30));
    }

    #[test]
    fn test_poll_policy_default() {
        let policy = PollPolicy::default();
        assert_eq!(policy.interval, Duration::from_secs(3));
        assert_eq!(policy.timeout, Duration::from_secs(180));
        assert_eq!(policy.settle, Duration::from_secs(20));
    }

    #[test]
    fn test_poll_until_ready() {
        let clock = StepClock::new();
        let policy = PollPolicy::new(Duration::from_secs(3), Duration::from_secs(30), Duration::ZERO);
        let mut calls = 0;

        let outcome = poll_until(&clock, &CancelToken::new(), &policy, || {
            calls += 1;
            Ok((calls == 3).then_some(calls))
        })
        .unwrap();

        assert_eq!(outcome, PollOutcome::Ready(3));
        assert_eq!(clock.offset.get(), Duration::from_secs(9));
    }

    #[test]
    fn test_poll_until_never_probes_after_deadline() {
        let clock = StepClock::new();
        let policy = PollPolicy::new(Duration::from_secs(3), Duration::from_secs(10), Duration::ZERO);
        let mut probe_times = Vec::new();

        let outcome = poll_until(&clock, &CancelToken::new(), &policy, || {
            probe_times.push(clock.offset.get());
            Ok(None::<()>)
        })
        .unwrap();

        assert_eq!(outcome, PollOutcome::Expired { polls: 4 });
        assert!(probe_times.iter().all(|t| *t <= Duration::from_secs(10)));
        assert_eq!(probe_times.last(), Some(&Duration::from_secs(10)));
    }

    #[test]
    fn test_poll_until_cancelled() {
        let clock = StepClock::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = poll_until(&clock, &cancel, &PollPolicy::default(), || Ok(Some(())));
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_system_clock_sleep_ends_on_cancel() {
        let cancel = CancelToken::new();
        let clock = SystemClock::with_cancel(cancel.clone());
        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            trigger.cancel();
        });

        let started = Instant::now();
        clock.sleep(Duration::from_secs(30));
        handle.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(cancel.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_system_clock_sleeps_full_duration() {
        let clock = SystemClock::with_cancel(CancelToken::new());
        let started = Instant::now();
        clock.sleep(Duration::from_millis(300));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
