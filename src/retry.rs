//! Retry policy: circuit breaker and scheduled retries.
//!
//! [`CircuitBreaker`] bounds how often *automatic* connection attempts
//! may run after failures: one failure engages a short cooldown, a run
//! of consecutive failures engages an extended one. User-initiated
//! attempts always pass the gate but still feed the counters.
//!
//! [`Backoff`] + [`run`] replace ad hoc polling loops: a bounded number
//! of attempts a fixed delay apart, abandoned early when the
//! caller's [`CancellationToken`] fires.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Thresholds and cooldowns for the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Consecutive failures that engage the short cooldown.
    pub short_threshold: u32,
    pub short_cooldown: Duration,
    /// Consecutive failures that engage the extended cooldown.
    pub long_threshold: u32,
    pub long_cooldown: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            short_threshold: 1,
            short_cooldown: Duration::from_secs(30),
            long_threshold: 3,
            long_cooldown: Duration::from_secs(5 * 60),
        }
    }
}

/// Rolling count of consecutive unusable-provider detections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureCounter {
    pub consecutive: u32,
    pub last_failure: Option<Instant>,
}

/// Which cooldown tier is engaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cooldown {
    Short,
    Extended,
}

/// Two-tier circuit breaker over a [`FailureCounter`].
#[derive(Debug)]
pub struct CircuitBreaker {
    config: RetryConfig,
    counter: FailureCounter,
    locked_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            counter: FailureCounter::default(),
            locked_until: None,
        }
    }

    /// Whether an attempt may run now. User-initiated attempts always may.
    pub fn should_attempt(&self, now: Instant, user_initiated: bool) -> bool {
        user_initiated || self.remaining(now).is_none()
    }

    /// Time left on the active cooldown, if one is engaged.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.locked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    pub fn is_locked(&self, now: Instant) -> bool {
        self.remaining(now).is_some()
    }

    /// Whether the extended cooldown is the one engaged.
    pub fn is_extended(&self, now: Instant) -> bool {
        self.is_locked(now) && self.tier() == Some(Cooldown::Extended)
    }

    /// Record a failed attempt and (re)arm the cooldown for the tier the
    /// new count falls in. Returns the engaged tier.
    pub fn record_failure(&mut self, now: Instant) -> Option<Cooldown> {
        self.counter.consecutive = self.counter.consecutive.saturating_add(1);
        self.counter.last_failure = Some(now);

        let tier = self.tier();
        let cooldown = match tier {
            Some(Cooldown::Extended) => self.config.long_cooldown,
            Some(Cooldown::Short) => self.config.short_cooldown,
            None => return None,
        };
        self.locked_until = Some(now + cooldown);
        tracing::debug!(
            consecutive = self.counter.consecutive,
            ?tier,
            cooldown_secs = cooldown.as_secs(),
            "circuit breaker armed"
        );
        tier
    }

    /// Reset the counter and clear any cooldown.
    pub fn record_success(&mut self) {
        if self.counter.consecutive > 0 || self.locked_until.is_some() {
            tracing::debug!(
                consecutive = self.counter.consecutive,
                "circuit breaker reset"
            );
        }
        self.counter = FailureCounter::default();
        self.locked_until = None;
    }

    pub fn counter(&self) -> FailureCounter {
        self.counter
    }

    fn tier(&self) -> Option<Cooldown> {
        let n = self.counter.consecutive;
        if n >= self.config.long_threshold {
            Some(Cooldown::Extended)
        } else if n >= self.config.short_threshold {
            Some(Cooldown::Short)
        } else {
            None
        }
    }
}

/// A bounded retry schedule with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub delay: Duration,
}

impl Backoff {
    pub const fn fixed(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// Outcome of a single scheduled attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// Stop with this value.
    Done(T),
    /// Try again if the schedule allows; this value is returned if not.
    Retry(T),
}

/// Run `op` on the `backoff` schedule until it returns [`Step::Done`],
/// the attempts run out, or `cancel` fires.
///
/// Returns the last value produced, or `None` if cancelled before the
/// first attempt finished.
pub async fn run<T, F, Fut>(backoff: &Backoff, cancel: &CancellationToken, mut op: F) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Step<T>>,
{
    let mut last = None;
    for attempt in 0..backoff.attempts.max(1) {
        if attempt > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return last,
                _ = tokio::time::sleep(backoff.delay) => {}
            }
        }
        let step = tokio::select! {
            _ = cancel.cancelled() => return last,
            step = op(attempt) => step,
        };
        match step {
            Step::Done(value) => return Some(value),
            Step::Retry(value) => last = Some(value),
        }
    }
    last
}
