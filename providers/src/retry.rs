//! Bounded retry with exponential backoff.
//!
//! # Retry Policy
//!
//! - Max attempts: 3 (initial call plus two retries)
//! - Initial delay: 500ms, doubled per attempt
//! - Max delay: 8 seconds
//! - Hard timeout per attempt: 10 minutes
//!
//! Backoff is deterministic (no jitter) so `delay(k + 1) >= delay(k)` holds
//! until the delay reaches `max_delay`. A vendor-supplied `Retry-After` is
//! preferred over the computed delay and still clamped to `max_delay`.
//!
//! # Retryable Conditions
//!
//! - Connection, timeout and body transport errors
//! - Premature end of stream
//! - HTTP 429, 5xx, and vendor "overloaded" signals
//! - Inactivity timeouts and hard timeouts
//! - `x-should-retry: true`
//!
//! Everything else is returned immediately without consuming further attempts.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{CompletionRequest, ProviderAdapter, ProviderError, StreamObserver};
use helm_types::CompletionResult;

/// Retry configuration. Immutable; derive per-call variants with the `with_*` builders.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `0` behaves like `1`.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Hard limit on a single attempt, independent of the inactivity window.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
            timeout: Some(Duration::from_secs(10 * 60)),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retrying after failed attempt `attempt` (1-based):
    /// `min(initial_delay * backoff_multiplier^(attempt - 1), max_delay)`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            1.0
        };
        let base = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Delay to sleep before the next attempt, preferring the vendor's hint.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_delay),
            None => self.backoff_delay(attempt),
        }
    }
}

/// How the retry loop interprets an error type.
pub trait RetryClassify: Sized {
    fn is_retryable(&self) -> bool;

    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Error to report when an attempt exceeds the hard timeout.
    fn timed_out(after: Duration) -> Self;

    /// Error to report when the caller cancels during an attempt or backoff.
    fn cancelled() -> Self;
}

impl RetryClassify for ProviderError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    fn retry_after(&self) -> Option<Duration> {
        ProviderError::retry_after(self)
    }

    fn timed_out(after: Duration) -> Self {
        ProviderError::HardTimeout { after }
    }

    fn cancelled() -> Self {
        ProviderError::Cancelled
    }
}

/// Callback invoked before each backoff sleep with `(attempt, error, delay)`.
pub type OnRetry<'a, E> = &'a mut (dyn FnMut(u32, &E, Duration) + Send);

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Run `operation` until it succeeds, fails non-retryably, or attempts run out.
///
/// Each attempt is raced against `policy.timeout` and `cancel`. The backoff
/// sleep is raced against `cancel` too, so an interrupt is honored at every
/// suspension point.
pub async fn with_retry<T, E, F, Fut>(
    mut operation: F,
    policy: &RetryPolicy,
    mut on_retry: Option<OnRetry<'_, E>>,
    cancel: Option<&CancellationToken>,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryClassify + Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1u32;

    loop {
        let call = operation();
        let outcome = tokio::select! {
            biased;
            () = cancelled(cancel) => return Err(E::cancelled()),
            outcome = async {
                match policy.timeout {
                    Some(limit) => tokio::time::timeout(limit, call)
                        .await
                        .unwrap_or_else(|_| Err(E::timed_out(limit))),
                    None => call.await,
                }
            } => outcome,
        };

        let error = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "Request succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !error.is_retryable() {
            tracing::debug!(attempt, error = %error, "Non-retryable error");
            return Err(error);
        }

        if attempt >= attempts {
            tracing::warn!(attempts, error = %error, "Retries exhausted");
            return Err(error);
        }

        let delay = policy.delay_for(attempt, error.retry_after());
        tracing::warn!(
            attempt,
            max_attempts = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after transient error"
        );
        if let Some(callback) = on_retry.as_mut() {
            callback(attempt, &error, delay);
        }

        tokio::select! {
            biased;
            () = cancelled(cancel) => return Err(E::cancelled()),
            () = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}

/// Resilient entry point for one completion: retries `adapter` under `policy`,
/// honoring the request's abort signal during backoff.
///
/// Deltas from failed attempts have already reached `observer`; only the
/// returned result reflects the successful attempt.
pub async fn stream_with_retry<A>(
    adapter: &A,
    request: &CompletionRequest<'_>,
    observer: &dyn StreamObserver,
    policy: &RetryPolicy,
    on_retry: Option<OnRetry<'_, ProviderError>>,
) -> Result<CompletionResult, ProviderError>
where
    A: ProviderAdapter + ?Sized,
{
    with_retry(
        move || adapter.stream_completion(request, observer),
        policy,
        on_retry,
        Some(&request.options.abort),
    )
    .await
}
