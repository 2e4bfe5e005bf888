//! Retry classification and backoff
//!
//! Two retry scales live here:
//! - [`with_retry`] retries a single async operation in-process with
//!   exponential backoff (used for connecting to the remote endpoint).
//! - [`Backoff`] computes how long the ledger parks a failed job before it
//!   becomes claimable again. The default is a flat delay.
//!
//! # Example
//!
//! ```no_run
//! use secure_ingest::retry::{IsRetryable, with_retry};
//! use secure_ingest::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! with_retry(&config, || async { Ok::<_, MyError>(()) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{BackoffConfig, RetryConfig};
use crate::error::FetchError;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (dropped connections, timeouts, short transfers) return `true`.
/// Permanent failures (bad credentials, missing files, anything cryptographic) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Connection(_)
            | FetchError::TransientIo(_)
            | FetchError::Timeout { .. }
            | FetchError::LengthMismatch { .. } => true,
            FetchError::Auth(_) | FetchError::RemoteDirMissing(_) | FetchError::NotFound(_) => {
                false
            }
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// Returns the successful result or the last error after `config.max_attempts`
/// retries. Non-retryable errors are returned immediately.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                let wait = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };
                tokio::time::sleep(wait).await;

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add uniformly distributed jitter: the result lies in `[delay, 2 * delay]`
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

/// Delay before a failed job becomes claimable again
pub trait Backoff: Send + Sync + std::fmt::Debug {
    /// Delay after the `retry_count`-th failure (1-based)
    fn delay(&self, retry_count: u32) -> Duration;
}

/// Flat delay regardless of how many times the job has failed
#[derive(Clone, Copy, Debug)]
pub struct FixedBackoff {
    /// The delay
    pub delay: Duration,
}

impl Backoff for FixedBackoff {
    fn delay(&self, _retry_count: u32) -> Duration {
        self.delay
    }
}

/// `initial * multiplier^(retry_count - 1)`, capped at `max`
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    /// Delay after the first failure
    pub initial: Duration,
    /// Upper bound
    pub max: Duration,
    /// Growth factor
    pub multiplier: f64,
    /// Add up to 100% random jitter (applied before the cap)
    pub jitter: bool,
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(63) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let base = if secs.is_finite() {
            Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
        } else {
            self.max
        };
        let delay = if self.jitter { add_jitter(base) } else { base };
        delay.min(self.max)
    }
}

/// How many failures a job may accumulate and how long it waits between them
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Failures after which a job becomes FAILED_TERMINAL
    pub max_retries: u32,
    /// Delay schedule
    pub backoff: Arc<dyn Backoff>,
}

impl RetryPolicy {
    /// Policy from the ledger section of the configuration
    pub fn from_config(config: &crate::config::LedgerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: backoff_from_config(&config.backoff),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&crate::config::LedgerConfig::default())
    }
}

/// Build the configured backoff strategy
pub fn backoff_from_config(config: &BackoffConfig) -> Arc<dyn Backoff> {
    match *config {
        BackoffConfig::Fixed { delay } => Arc::new(FixedBackoff { delay }),
        BackoffConfig::Exponential {
            initial_delay,
            max_delay,
            multiplier,
            jitter,
        } => Arc::new(ExponentialBackoff {
            initial: initial_delay,
            max: max_delay,
            multiplier,
            jitter,
        }),
    }
}
