//! Circuit breaker and retry-with-backoff primitives shared by every
//! component that talks to Redis, Postgres, or the object store.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;

/// Circuit breaker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through normally
    Closed,
    /// Requests are rejected without attempting the call
    Open,
    /// A limited number of probe requests are allowed through
    HalfOpen,
}

/// Tuning for a `CircuitBreaker`.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before tripping to `Open`
    pub failure_threshold: u32,
    /// Consecutive successes in `HalfOpen` before closing again
    pub success_threshold: u32,
    /// How long to stay `Open` before allowing a probe
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Error returned when the breaker is open.
#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    /// The breaker is open; the call was not attempted
    #[error("circuit breaker open")]
    Open,
}

/// Rolling counters on breaker activity.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerStatistics {
    /// Calls allowed through
    pub total_calls: u64,
    /// Calls rejected while open
    pub rejected_calls: u64,
    /// Times the breaker tripped open
    pub trips: u64,
}

struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// A failure-counting breaker guarding a single dependency.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<CircuitBreakerInner>,
    total_calls: AtomicU64,
    rejected_calls: AtomicU64,
    trips: AtomicU64,
}

impl CircuitBreaker {
    /// Build a breaker with `config`.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(CircuitBreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
            total_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            trips: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state, transitioning `Open` -> `HalfOpen` if the
    /// open duration has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.write();
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.open_duration {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                }
            }
        }
        inner.state
    }

    /// Run `f` through the breaker, short-circuiting with
    /// `CircuitBreakerError::Open` when tripped.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if self.state() == CircuitState::Open {
            self.rejected_calls.fetch_add(1, Ordering::Relaxed);
            return Err(CircuitBreakerError::Open);
        }

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(_) => {
                self.on_failure();
                Err(CircuitBreakerError::Open)
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.write();
        inner.consecutive_failures = 0;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                }
            }
            CircuitState::Closed => {}
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.write();
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.config.failure_threshold
            && inner.state != CircuitState::Open
        {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            self.trips.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot of breaker counters.
    pub fn statistics(&self) -> CircuitBreakerStatistics {
        CircuitBreakerStatistics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            trips: self.trips.load(Ordering::Relaxed),
        }
    }
}

/// Exponential backoff retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Multiplier applied to the backoff after each attempt
    pub backoff_multiplier: f64,
    /// Ceiling on the backoff delay
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Runs a fallible async operation with exponential backoff between
/// attempts.
pub struct RetryPolicy {
    config: RetryConfig,
    attempts_made: Arc<AtomicU32>,
}

impl RetryPolicy {
    /// Build a policy from `config`.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts_made: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Retry `f` until it succeeds or `max_attempts` is exhausted.
    pub async fn run<F, Fut, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut backoff = self.config.initial_backoff;
        let mut last_err = None;

        for attempt in 0..self.config.max_attempts {
            self.attempts_made.fetch_add(1, Ordering::Relaxed);
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < self.config.max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff
                            .mul_f64(self.config.backoff_multiplier)
                            .min(self.config.max_backoff);
                    }
                }
            }
        }

        Err(last_err.expect("at least one attempt is always made"))
    }

    /// Total attempts made across all `run` calls on this policy.
    pub fn attempts_made(&self) -> u32 {
        self.attempts_made.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;

    #[tokio::test]
    async fn test_circuit_breaker_trips_after_threshold() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            open_duration: Duration::from_secs(60),
        });

        for _ in 0..2 {
            let _ = breaker
                .call(|| async { Err::<(), &str>("boom") })
                .await;
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        let result = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test]
    async fn test_retry_policy_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            backoff_multiplier: 1.0,
            max_backoff: Duration::from_millis(5),
        });

        let counter = Arc::new(Counter::new(0));
        let counter_clone = counter.clone();
        let result = policy
            .run(|| {
                let counter = counter_clone.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::Relaxed);
                    if n < 2 {
                        Err("not yet")
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(policy.attempts_made(), 3);
    }
}
