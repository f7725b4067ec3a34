// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded retries with exponential backoff for item fetches
//!
//! Every attempt is limited by [`RetryPolicy::attempt_timeout`] and raced
//! against a [`CancellationToken`]. Only failures that report themselves as
//! retryable are attempted again; the backoff sleep between attempts is
//! interruptible by cancellation as well.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{FailureKind, FetchError};

/// Errors that can tell whether another attempt may succeed
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Transient
    }
}

/// Retry behavior for a single item
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Stretch each delay by a random factor between 1 and 2
    pub jitter: bool,
    /// Upper bound for one attempt; `None` lets attempts run indefinitely
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
            attempt_timeout: Some(Duration::from_secs(30 * 60)),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based), without jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// A retry that is about to happen
#[derive(Debug)]
pub struct RetryNotice<'a> {
    /// The attempt that just failed (1-based)
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: &'a FetchError,
}

/// How a retried operation ended
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    /// The last error, either fatal or transient with all attempts used
    Failed { error: FetchError, attempts: u32 },
    Cancelled,
}

/// Run `operation` until it succeeds, fails fatally, runs out of attempts
/// or `cancel` fires
///
/// `operation` receives the 1-based attempt number. `on_retry` is called
/// before every backoff sleep.
pub async fn fetch_with_retry<T, F, Fut, R>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: R,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
    R: FnMut(RetryNotice<'_>),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return RetryOutcome::Cancelled;
        }
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RetryOutcome::Cancelled,
            result = run_attempt(policy.attempt_timeout, operation(attempt)) => result,
        };

        let error = match result {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "Fetch succeeded after retry");
                }
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                };
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            tracing::debug!(error = %error, attempt, "Fetch failed with non-retryable error");
            return RetryOutcome::Failed {
                error,
                attempts: attempt,
            };
        }

        if attempt >= max_attempts {
            tracing::debug!(
                error = %error,
                attempts = attempt,
                "Fetch failed after all retry attempts exhausted"
            );
            return RetryOutcome::Failed {
                error,
                attempts: attempt,
            };
        }

        let base = policy.backoff_delay(attempt);
        let delay = if policy.jitter { add_jitter(base) } else { base };

        tracing::debug!(
            error = %error,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Fetch failed, retrying"
        );
        on_retry(RetryNotice {
            attempt,
            max_attempts,
            delay,
            error: &error,
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return RetryOutcome::Cancelled,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_attempt<T, Fut>(limit: Option<Duration>, attempt: Fut) -> Result<T, FetchError>
where
    Fut: Future<Output = Result<T, FetchError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .unwrap_or(Err(FetchError::Timeout(limit))),
        None => attempt.await,
    }
}

/// Stretch `delay` by a uniformly random factor in `[1, 2]`
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + factor))
}
