//! Retry and circuit breaking for remote provider calls.
//!
//! A [`ConnectionPool`] wraps every call to a remote service in
//! exponential-backoff retries guarded by a [`CircuitBreaker`]:
//!
//! ```text
//!   CLOSED --(N consecutive failures)--> OPEN
//!   OPEN --(recovery timeout elapsed)--> HALF_OPEN (one probe allowed)
//!   HALF_OPEN --(probe succeeds)--> CLOSED
//!   HALF_OPEN --(probe fails)--> OPEN
//! ```
//!
//! Breaker state and pool counters each sit behind one mutex, and no mutex
//! guard is held across an `.await`. Retry delays sleep on the calling task.
//! A call cancelled mid-flight still frees its active slot and its
//! half-open probe.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use second_brain_core::error::{codes, BrainError};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SupabaseConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let was_probe = inner.state == CircuitState::HalfOpen;
        inner.probe_in_flight = false;
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        if was_probe || inner.failure_count >= self.failure_threshold {
            inner.state = CircuitState::Open;
        }
    }

    /// Whether a call may proceed now. In `HALF_OPEN` only one caller gets
    /// `true` until the probe reports back.
    pub fn can_execute(&self) -> bool {
        self.admit().is_some()
    }

    /// Admit a call. `Some(true)` means the caller holds the half-open probe
    /// and must report back or call [`release_probe`](Self::release_probe).
    fn admit(&self) -> Option<bool> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    None
                } else {
                    inner.probe_in_flight = true;
                    Some(true)
                }
            }
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.recovery_timeout);
                if !recovered {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                Some(true)
            }
        }
    }

    /// Give up a probe without a verdict. The breaker stays half-open and
    /// admits the next caller.
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn transition_to_half_open(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::HalfOpen;
        inner.probe_in_flight = false;
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.probe_in_flight = false;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_backoff: f64,
    pub circuit_failure_threshold: u32,
    pub circuit_recovery_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            retry_backoff: 2.0,
            circuit_failure_threshold: 5,
            circuit_recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&SupabaseConfig> for PoolConfig {
    fn from(config: &SupabaseConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs_f64(config.retry_delay_secs.max(0.0)),
            retry_backoff: config.retry_backoff,
            circuit_failure_threshold: config.circuit_failure_threshold,
            circuit_recovery_timeout: Duration::from_secs_f64(
                config.circuit_recovery_timeout_secs.max(0.0),
            ),
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    active: usize,
    total: u64,
    failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolHealth {
    pub state: CircuitState,
    pub active_connections: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub failure_rate: f64,
    pub config: PoolConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    pub active_connections: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub circuit_state: CircuitState,
}

/// Bookkeeping for one admitted call. Dropping it, on completion or when the
/// caller's future is cancelled, frees the active slot and any unreported
/// half-open probe.
struct CallGuard<'a> {
    pool: &'a ConnectionPool,
    holds_probe: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.holds_probe {
            self.pool.breaker.release_probe();
        }
        let mut counters = self.pool.counters();
        counters.active = counters.active.saturating_sub(1);
    }
}

pub struct ConnectionPool {
    service: String,
    config: PoolConfig,
    breaker: CircuitBreaker,
    counters: Mutex<PoolCounters>,
}

impl ConnectionPool {
    pub fn new(service: impl Into<String>, config: PoolConfig) -> Self {
        let breaker =
            CircuitBreaker::new(config.circuit_failure_threshold, config.circuit_recovery_timeout);
        Self {
            service: service.into(),
            config,
            breaker,
            counters: Mutex::new(PoolCounters::default()),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, PoolCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn circuit_open(&self) -> BrainError {
        BrainError::provider(&self.service, "Circuit breaker is OPEN. Request blocked.")
            .with_code(codes::CIRCUIT_OPEN)
    }

    /// Run `operation` with up to `max_retries` retries.
    ///
    /// Every failed attempt is recorded on the breaker. Once the breaker
    /// opens, remaining attempts are abandoned with `CIRCUIT_OPEN`.
    pub async fn execute_with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, BrainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrainError>>,
    {
        let Some(holds_probe) = self.breaker.admit() else {
            self.counters().failed += 1;
            return Err(self.circuit_open());
        };

        {
            let mut counters = self.counters();
            counters.total += 1;
            counters.active += 1;
        }
        let mut guard = CallGuard {
            pool: self,
            holds_probe,
        };

        self.run_attempts(&mut operation, &mut guard).await
    }

    async fn run_attempts<T, F, Fut>(
        &self,
        operation: &mut F,
        guard: &mut CallGuard<'_>,
    ) -> Result<T, BrainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrainError>>,
    {
        let mut delay = self.config.retry_delay;
        let mut attempt = 0;
        loop {
            let outcome = operation().await;
            guard.holds_probe = false;
            match outcome {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    self.breaker.record_failure();
                    self.counters().failed += 1;

                    if attempt >= self.config.max_retries {
                        warn!(service = %self.service, attempts = attempt + 1, error = %err, "retries exhausted");
                        return Err(err);
                    }
                    debug!(service = %self.service, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(self.config.retry_backoff);
                    attempt += 1;

                    match self.breaker.admit() {
                        Some(probe) => guard.holds_probe = probe,
                        None => return Err(self.circuit_open()),
                    }
                }
            }
        }
    }

    pub fn health_check(&self) -> PoolHealth {
        let counters = self.counters();
        let failure_rate = if counters.total > 0 {
            counters.failed as f64 / counters.total as f64
        } else {
            0.0
        };
        PoolHealth {
            state: self.breaker.state(),
            active_connections: counters.active,
            total_requests: counters.total,
            failed_requests: counters.failed,
            failure_rate,
            config: self.config.clone(),
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        let counters = self.counters();
        PoolMetrics {
            active_connections: counters.active,
            total_requests: counters.total,
            failed_requests: counters.failed,
            circuit_state: self.breaker.state(),
        }
    }
}
