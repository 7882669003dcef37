//! Retry with exponential backoff and a circuit breaker on top of it
//!
//! The circuit breaker tracks consecutive failed invocations. Once failures
//! reach the threshold the circuit *opens* and calls are rejected without
//! touching the dependency. After the reset window the circuit is
//! *half-open*: one single-attempt trial request is allowed, success closes the
//! circuit and failure re-opens it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{E2eError, E2eResult};

type RetryHook = Arc<dyn Fn(&E2eError, u32, Duration) + Send + Sync>;
type RetryPredicate = Arc<dyn Fn(&E2eError) -> bool + Send + Sync>;

/// Retry configuration, consumed once per [`retry`] call.
#[derive(Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub delay: Duration,
    /// Multiplier applied to the delay after every failed attempt
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay
    pub max_delay: Option<Duration>,
    /// Called with (error, failed attempt number, upcoming delay)
    pub on_retry: Option<RetryHook>,
    /// Returning false rethrows immediately. Default: retry everything.
    pub should_retry: Option<RetryPredicate>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: None,
            on_retry: None,
            should_retry: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_delay", &self.max_delay)
            .field("on_retry", &self.on_retry.is_some())
            .field("should_retry", &self.should_retry.is_some())
            .finish()
    }
}

impl RetryOptions {
    pub fn new(max_attempts: u32, delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            delay,
            backoff_multiplier,
            ..Default::default()
        }
    }

    pub fn on_retry(mut self, hook: impl Fn(&E2eError, u32, Duration) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn should_retry(mut self, predicate: impl Fn(&E2eError) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay slept after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let delay = Duration::from_millis(millis.max(0.0).round() as u64);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

/// Invoke `op` up to `max_attempts` times with exponential backoff.
pub async fn retry<T, F, Fut>(mut op: F, options: RetryOptions) -> E2eResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = E2eResult<T>>,
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if let Some(predicate) = &options.should_retry {
            if !predicate(&err) {
                debug!("Not retrying after attempt {}: {}", attempt, err);
                return Err(err);
            }
        }

        if attempt >= max_attempts {
            return Err(E2eError::RetryExhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        let delay = options.delay_for(attempt);
        debug!(
            "Attempt {}/{} failed ({}), retrying in {} ms",
            attempt,
            max_attempts,
            err,
            delay.as_millis()
        );
        if let Some(hook) = &options.on_retry {
            hook(&err, attempt, delay);
        }
        tokio::time::sleep(delay).await;
    }
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy, calls allowed
    Closed,
    /// Tripped, calls rejected until the reset window elapses
    Open,
    /// Reset window elapsed, one trial request allowed
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// [`retry`] guarded by a circuit breaker.
#[derive(Debug)]
pub struct RetryWithCircuitBreaker {
    options: RetryOptions,
    failure_threshold: u32,
    reset_time: Duration,
    state: Mutex<BreakerState>,
}

impl RetryWithCircuitBreaker {
    pub fn new(options: RetryOptions, failure_threshold: u32, reset_time: Duration) -> Self {
        Self {
            options,
            failure_threshold: failure_threshold.max(1),
            reset_time,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn state(&self) -> CircuitState {
        let state = self.state.lock();
        self.state_of(&state)
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Close the circuit and forget past failures.
    pub fn reset(&self) {
        *self.state.lock() = BreakerState::default();
    }

    fn state_of(&self, state: &BreakerState) -> CircuitState {
        if state.consecutive_failures < self.failure_threshold {
            return CircuitState::Closed;
        }
        match state.last_failure {
            Some(at) if at.elapsed() < self.reset_time => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    pub async fn execute<T, F, Fut>(&self, op: F) -> E2eResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = E2eResult<T>>,
    {
        self.execute_with(self.options.clone(), op).await
    }

    /// Like [`execute`](Self::execute) but with per-call retry options,
    /// sharing this breaker's state.
    pub async fn execute_with<T, F, Fut>(&self, options: RetryOptions, op: F) -> E2eResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = E2eResult<T>>,
    {
        let options = {
            let state = self.state.lock();
            match self.state_of(&state) {
                CircuitState::Closed => options,
                CircuitState::HalfOpen => {
                    debug!("Circuit half-open, sending a single trial request");
                    RetryOptions {
                        max_attempts: 1,
                        ..options
                    }
                }
                CircuitState::Open => {
                    let elapsed = state.last_failure.map(|at| at.elapsed()).unwrap_or_default();
                    let remaining = self.reset_time.saturating_sub(elapsed);
                    return Err(E2eError::CircuitOpen {
                        remaining_ms: remaining.as_millis() as u64,
                    });
                }
            }
        };

        match retry(op, options).await {
            Ok(value) => {
                self.reset();
                Ok(value)
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.consecutive_failures += 1;
                state.last_failure = Some(Instant::now());
                if state.consecutive_failures == self.failure_threshold {
                    warn!(
                        "Circuit opened after {} consecutive failures: {}",
                        state.consecutive_failures, e
                    );
                }
                Err(e)
            }
        }
    }
}
