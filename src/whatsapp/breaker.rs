//! Per-endpoint circuit breaker.
//!
//! closed → open after `fail_max` consecutive retryable failures; open →
//! half_open after `reset_timeout`; a success in half_open closes it, a
//! failure reopens. While open, callers fail fast and the failure is not
//! retryable.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::CircuitBreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

pub struct CircuitBreaker {
    fail_max: u32,
    reset_timeout: Duration,
    half_open_max: u32,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(settings: &CircuitBreakerSettings) -> Self {
        CircuitBreaker {
            fail_max: settings.fail_max,
            reset_timeout: settings.reset_timeout,
            half_open_max: settings.half_open_max.max(1),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    /// Whether a request may proceed. Transitions open → half_open when the
    /// reset timeout elapsed, admitting up to `half_open_max` probes.
    pub async fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    info!("circuit_breaker_half_open");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.half_open_max {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != BreakerState::Closed {
            info!("circuit_breaker_closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.half_open_in_flight = 0;
    }

    /// Record a failure. Only retryable failures count toward opening;
    /// in half_open any failure reopens immediately.
    pub async fn record_failure(&self, retryable: bool) -> BreakerState {
        let mut inner = self.inner.lock().await;

        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.half_open_in_flight = 0;
            warn!("circuit_breaker_reopened");
            return inner.state;
        }

        if retryable {
            inner.consecutive_failures += 1;
            if inner.consecutive_failures >= self.fail_max {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    consecutive_failures = inner.consecutive_failures,
                    "circuit_breaker_opened"
                );
            }
        }
        inner.state
    }
}
