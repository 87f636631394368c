//! Resilient HTTP transport for the remote provider.
//!
//! The engine itself only sees success, failure, or "not modified";
//! timeouts, retries with exponential backoff, and the circuit breaker
//! all live here, injected into [`RemoteProvider`](super::remote::RemoteProvider).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::{RequestBuilder, Response, StatusCode};
use tokio::time::sleep;

use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
pub const DEFAULT_BREAKER_RESET: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 15_000,
            jitter_ms: 100,
        }
    }
}

fn retry_delay(policy: &RetryPolicy, attempt: usize) -> Duration {
    let shift = (attempt as u32).min(12);
    let base = policy.base_delay_ms.saturating_mul(1u64 << shift);
    let capped = base.min(policy.max_delay_ms.max(policy.base_delay_ms));
    let jitter = if policy.jitter_ms == 0 {
        0
    } else {
        (attempt as u64 * 37) % (policy.jitter_ms + 1)
    };
    Duration::from_millis(capped.saturating_add(jitter))
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Circuit breaker state, exposed for health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker with a single half-open probe.
#[derive(Debug)]
pub struct Breaker {
    threshold: u32,
    reset: Duration,
    inner: Mutex<BreakerInner>,
}

impl Breaker {
    pub fn new(threshold: u32, reset: Duration) -> Self {
        Self {
            threshold,
            reset,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Returns whether a call may proceed. In the open state only the
    /// call that observes an elapsed reset window gets through, as the
    /// half-open probe.
    fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.reset)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }
}

/// HTTP client with retry, backoff and circuit breaking.
pub struct Transport {
    client: reqwest::Client,
    retry: RetryPolicy,
    breaker: Breaker,
    label: String,
}

impl Transport {
    pub fn new(label: impl Into<String>) -> Result<Self> {
        Self::with_timeout(label, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(label: impl Into<String>, timeout: Duration) -> Result<Self> {
        let label = label.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| Error::Provider(format!("failed to build {label} client: {err}")))?;

        Ok(Self {
            client,
            retry: RetryPolicy::default(),
            breaker: Breaker::new(DEFAULT_BREAKER_THRESHOLD, DEFAULT_BREAKER_RESET),
            label,
        })
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn breaker(mut self, breaker: Breaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Sends the request, retrying retryable failures within the retry
    /// budget. The circuit breaker sees one outcome per `send` call,
    /// not one per attempt.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        if !self.breaker.try_acquire() {
            return Err(Error::CircuitOpen(self.label.clone()));
        }

        let outcome = self.send_with_retry(builder).await;
        match &outcome {
            Ok(response) if !response.status().is_server_error() => self.breaker.record_success(),
            _ => self.breaker.record_failure(),
        }
        outcome
    }

    async fn send_with_retry(&self, builder: RequestBuilder) -> Result<Response> {
        let total_attempts = self.retry.max_retries.saturating_add(1);

        for attempt in 0..total_attempts {
            let Some(request) = builder.try_clone() else {
                return Err(Error::Provider(format!(
                    "{} request could not be retried because its body is not clonable",
                    self.label
                )));
            };

            match request.send().await {
                Ok(response) => {
                    if is_retryable_status(response.status()) && attempt + 1 < total_attempts {
                        let status = response.status();
                        let delay = retry_delay(&self.retry, attempt);
                        tracing::warn!(
                            label = %self.label,
                            status = %status,
                            attempt,
                            total_attempts,
                            delay_ms = delay.as_millis() as u64,
                            "retrying request after retryable HTTP status"
                        );
                        sleep(delay).await;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    if is_retryable_transport_error(&err) && attempt + 1 < total_attempts {
                        let delay = retry_delay(&self.retry, attempt);
                        tracing::warn!(
                            label = %self.label,
                            error = %err,
                            attempt,
                            total_attempts,
                            delay_ms = delay.as_millis() as u64,
                            "retrying request after transport error"
                        );
                        sleep(delay).await;
                        continue;
                    }
                    return Err(Error::Provider(format!(
                        "{} request failed: {err}",
                        self.label
                    )));
                }
            }
        }

        Err(Error::Provider(format!(
            "{} request failed after retry budget was exhausted",
            self.label
        )))
    }
}
