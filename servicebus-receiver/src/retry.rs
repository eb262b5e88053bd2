//! Retry executor for operations that may fail transiently

use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    constants::{DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRY_DELAY, DEFAULT_RETRY_DELAY},
    error::Error,
};

/// How the delay between attempts grows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryMode {
    /// Wait the same delay before every retry
    Fixed,

    /// Double the delay before every retry, up to the maximum delay
    #[default]
    Exponential,
}

/// Retry policy
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Number of retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub retry_delay: Duration,

    /// Upper bound on the delay in exponential mode
    pub max_retry_delay: Duration,

    /// Back-off mode
    pub mode: RetryMode,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            mode: RetryMode::default(),
        }
    }
}

impl RetryOptions {
    fn delay(&self, retry: u32) -> Duration {
        match self.mode {
            RetryMode::Fixed => self.retry_delay,
            RetryMode::Exponential => {
                let factor = 2u32.saturating_pow(retry);
                self.retry_delay
                    .saturating_mul(factor)
                    .min(self.max_retry_delay)
            }
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or the retries
/// are exhausted
pub async fn retry<F, Fut, T>(
    mut operation: F,
    options: &RetryOptions,
    cancel: &CancellationToken,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut retry = 0;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = operation() => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if !error.is_retryable() || retry >= options.max_retries {
            if retry > 0 {
                warn!(attempts = retry + 1, %error, "Giving up after retries");
            }
            return Err(error);
        }

        let delay = options.delay(retry);
        debug!(retry = retry + 1, ?delay, %error, "Retrying");
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        retry += 1;
    }
}
