//! Read retries with capped exponential backoff. Writes are never retried.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Protocol(_) => {
            RetryDisposition::Retryable
        }
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Sleeps between attempts, one per allowed retry: the base delay, doubling each time
    /// and held at `max_delay` once reached.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let cap = self.max_delay;
        std::iter::successors(Some(self.base_delay.min(cap)), move |previous| {
            Some(previous.checked_mul(2).map_or(cap, |next| next.min(cap)))
        })
        .take(self.max_retries)
    }

    /// Run an idempotent read, retrying transient failures.
    pub async fn retry_read<T, F, Fut>(&self, op: &'static str, mut read: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut delays = self.delays().enumerate();
        loop {
            let err = match read().await {
                Ok(value) => return Ok(value),
                Err(err) if err.retry_disposition() == RetryDisposition::Retryable => err,
                Err(err) => return Err(err),
            };
            let Some((retry, delay)) = delays.next() else {
                return Err(err);
            };
            debug!(op, retry, ?delay, error = %err, "retrying store read");
            tokio::time::sleep(delay).await;
        }
    }
}
