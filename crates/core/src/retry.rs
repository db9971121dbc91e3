//! Retry logic with exponential backoff for artifact downloads

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Outcome of one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// Transient failure (connection, timeout, 5xx); try again.
    Retryable(String),
    /// Permanent failure (404, bad request); give up immediately.
    Fatal(String),
}

impl AttemptError {
    fn message(&self) -> &str {
        match self {
            Self::Retryable(message) | Self::Fatal(message) => message,
        }
    }
}

/// Retry a fallible async operation against `url` with exponential backoff.
///
/// Cancellation is checked before every attempt and interrupts the backoff
/// sleep, but never an attempt already in flight.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    url: &str,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, AttemptError>>,
{
    let mut backoff = create_backoff(config);
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        attempts += 1;

        let err = match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(%url, attempts, "Download succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => err,
        };

        if matches!(err, AttemptError::Fatal(_)) {
            debug!(%url, error = err.message(), "Error is not retryable, failing immediately");
            return Err(Error::download(url, attempts, err.message()));
        }

        if attempts >= config.max_attempts {
            warn!(%url, attempts, error = err.message(), "Download failed after maximum retries");
            return Err(Error::download(url, attempts, err.message()));
        }

        let Some(duration) = backoff.next_backoff() else {
            return Err(Error::download(url, attempts, err.message()));
        };

        warn!(
            %url,
            attempts,
            error = err.message(),
            retry_in_ms = duration.as_millis(),
            "Download failed, retrying"
        );
        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = tokio::time::sleep(duration) => {}
        }
    }
}

fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.initial_backoff_ms))
        .with_max_interval(Duration::from_millis(config.max_backoff_ms))
        .with_multiplier(config.backoff_multiplier)
        .with_max_elapsed_time(None) // We use max_attempts instead
        .build()
}
