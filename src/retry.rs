// src/retry.rs
//
// Retry policies for the dial loop and the publish path. Both currently retry
// forever; a capped or backoff policy only needs a new `RetryPolicy` impl.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::errors::{RelayError, Result};

pub trait RetryPolicy: Debug + Send + Sync {
    /// Delay before the next attempt after `attempt` failures, or `None` to give up.
    fn delay(&self, attempt: u32) -> Option<Duration>;
}

/// Retry at a constant interval, never giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedInterval {
    interval: Duration,
}

impl FixedInterval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl RetryPolicy for FixedInterval {
    fn delay(&self, _attempt: u32) -> Option<Duration> {
        Some(self.interval)
    }
}

/// Retry straight away, never giving up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Immediate;

impl RetryPolicy for Immediate {
    fn delay(&self, _attempt: u32) -> Option<Duration> {
        Some(Duration::ZERO)
    }
}

/// Gives up after `max_attempts` failures.
#[derive(Debug, Clone)]
pub struct Limited<P> {
    inner: P,
    max_attempts: u32,
}

impl<P: RetryPolicy> Limited<P> {
    pub fn new(inner: P, max_attempts: u32) -> Self {
        Self {
            inner,
            max_attempts,
        }
    }
}

impl<P: RetryPolicy> RetryPolicy for Limited<P> {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            None
        } else {
            self.inner.delay(attempt)
        }
    }
}

/// Run `op` until it succeeds or the policy gives up.
///
/// Fatal errors are returned immediately without consulting the policy.
pub async fn retry<P, F, Fut, T>(policy: &P, operation: &str, mut op: F) -> Result<T>
where
    P: RetryPolicy + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                attempt += 1;
                let Some(delay) = policy.delay(attempt) else {
                    return Err(RelayError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last: Box::new(err),
                    });
                };

                warn!(
                    operation,
                    attempt,
                    error = %err,
                    "{} failed, will retry in {:?}",
                    operation,
                    delay
                );
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }
        }
    }
}
