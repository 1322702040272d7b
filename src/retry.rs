//! Retry utilities with exponential backoff and jitter.
//!
//! Used for eventually-consistent conditions that span many objects (for
//! example, new trust material propagating into every service account token),
//! where a tight polling loop would hammer the API server.
//!
//! # Example
//!
//! ```ignore
//! use cluster_forge::retry::{wait_until, RetryConfig};
//!
//! wait_until(&RetryConfig::default(), &cancel, "tokens propagated", || async {
//!     Ok(all_tokens_updated().await?)
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Backoff configuration for a bounded wait.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = limited only by `timeout`)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Overall deadline for the wait
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            timeout: Duration::from_secs(600),
        }
    }
}

impl RetryConfig {
    /// Override the overall deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Jittered exponential delay sequence.
#[derive(Debug)]
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Start a new sequence from a config
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier,
        }
    }

    /// Next delay to sleep, already jittered (0.5x to 1.5x)
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(self.delay.as_secs_f64() * jitter);

        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.multiplier).min(self.max_delay.as_secs_f64()),
        );

        jittered
    }
}

/// Sleep for `duration` unless the token is cancelled first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Poll `check` with exponential backoff until it returns `Ok(true)`.
///
/// Errors from `check` are logged and retried. The wait gives up with
/// [`Error::ReadinessTimeout`] when the attempt budget or the deadline runs
/// out, and with [`Error::Cancelled`] as soon as `cancel` fires.
pub async fn wait_until<F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    what: &str,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + config.timeout;
    let mut backoff = Backoff::new(config);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        attempt += 1;

        match check().await {
            Ok(true) => return Ok(()),
            Ok(false) => debug!(what, attempt, "condition not met yet"),
            Err(e) => warn!(what, attempt, error = %e, "check failed, retrying"),
        }

        let exhausted = config.max_attempts > 0 && attempt >= config.max_attempts;
        let delay = backoff.next_delay();
        if exhausted || Instant::now() + delay > deadline {
            return Err(Error::ReadinessTimeout {
                what: what.to_string(),
                attempts: attempt,
            });
        }

        sleep_or_cancel(delay, cancel).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let cancel = CancellationToken::new();
        let result = wait_until(&fast_config(3), &cancel, "op", || async { Ok(true) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_succeeds_after_misses_and_errors() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result = wait_until(&fast_config(10), &cancel, "op", || {
            let c = c.clone();
            async move {
                match c.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(Error::validation("transient")),
                    1 => Ok(false),
                    _ => Ok(true),
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result = wait_until(&fast_config(3), &cancel, "tokens", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
        })
        .await;

        match result {
            Err(Error::ReadinessTimeout { what, attempts }) => {
                assert_eq!(what, "tokens");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadline_bounds_unlimited_attempts() {
        let config = RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 1.0,
            timeout: Duration::from_millis(50),
        };
        let cancel = CancellationToken::new();
        let result = wait_until(&config, &cancel, "never", || async { Ok(false) }).await;
        assert!(matches!(result, Err(Error::ReadinessTimeout { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_wait() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = wait_until(&fast_config(0), &cancel, "op", || async { Ok(false) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            backoff_multiplier: 10.0,
            ..Default::default()
        };
        let mut backoff = Backoff::new(&config);
        for _ in 0..5 {
            // jitter tops out at 1.5x of the cap
            assert!(backoff.next_delay() <= Duration::from_secs(6));
        }
    }
}
