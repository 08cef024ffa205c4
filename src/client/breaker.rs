//! Circuit Breaker
//!
//! One breaker per target component. All state lives behind a single
//! mutex; callers never touch it directly but acquire a [`BreakerPermit`]
//! and report the outcome through it.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,

    Open,

    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,

    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,

    pub consecutive_failures: u32,

    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,

    config: BreakerConfig,

    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `None` when the call must fail fast. Once the cooldown has
    /// elapsed the first caller gets the single half-open trial permit.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BreakerPermit> {
        let mut inner = self.inner.lock();

        let trial = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if !cooled {
                    return None;
                }
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                info!(target_component = %self.name, "circuit half-open, allowing trial call");
                true
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Some(BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            settled: false,
        })
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
            if inner.state == BreakerState::HalfOpen {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                info!(target_component = %self.name, "circuit closed");
            }
        } else if inner.state == BreakerState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
            if inner.state == BreakerState::HalfOpen {
                inner.consecutive_failures += 1;
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(target_component = %self.name, "trial call failed, circuit re-opened");
            }
        } else if inner.state == BreakerState::Closed {
            inner.consecutive_failures += 1;
            if inner.consecutive_failures >= self.config.failure_threshold {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    target_component = %self.name,
                    failures = inner.consecutive_failures,
                    "circuit opened"
                );
            }
        }
    }

    fn on_abandon(&self, trial: bool) {
        if trial {
            self.inner.lock().trial_in_flight = false;
        }
    }
}

/// Permission to make one call. Dropping it without reporting (for example
/// because the call was cancelled) counts as neither success nor failure.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon(self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "budget",
            BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(30),
            },
        ))
    }

    fn fail(breaker: &Arc<CircuitBreaker>) {
        breaker.try_acquire().expect("permit").failure();
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = breaker(3);
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Closed);
        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures() {
        let breaker = breaker(3);
        fail(&breaker);
        fail(&breaker);
        breaker.try_acquire().unwrap().success();
        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_trial_then_close() {
        let breaker = breaker(1);
        fail(&breaker);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.try_acquire().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.try_acquire().expect("trial permit");
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire().is_none());

        trial.success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = breaker(1);
        fail(&breaker);
        let first_open = breaker.snapshot().opened_at.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        breaker.try_acquire().unwrap().failure();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, BreakerState::Open);
        assert!(snapshot.opened_at.unwrap() > first_open);
        assert!(breaker.try_acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_releases_slot() {
        let breaker = breaker(1);
        fail(&breaker);
        tokio::time::advance(Duration::from_secs(30)).await;

        let trial = breaker.try_acquire().unwrap();
        drop(trial);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let retry = breaker.try_acquire().expect("slot released");
        assert!(retry.is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_call_does_not_count() {
        let breaker = breaker(2);
        fail(&breaker);
        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_permit_cannot_close_open_breaker() {
        let breaker = breaker(1);
        let stale = breaker.try_acquire().unwrap();
        fail(&breaker);
        stale.success();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
