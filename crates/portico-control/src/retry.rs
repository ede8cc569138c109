//! Timeouts and exponential backoff for external calls

use std::future::Future;
use std::time::Duration;

use portico_cert::AcmeError;
use portico_dns::DnsProviderError;
use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Errors that know whether another attempt may succeed
pub trait Transient {
    fn is_transient(&self) -> bool;

    /// Delay requested by the remote side
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Transient for DnsProviderError {
    fn is_transient(&self) -> bool {
        DnsProviderError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        DnsProviderError::retry_after(self)
    }
}

impl Transient for AcmeError {
    fn is_transient(&self) -> bool {
        AcmeError::is_transient(self)
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Non-transient failure, not retried
    #[error("{0}")]
    Permanent(E),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("gave up after {attempts} attempts: call timed out")]
    TimedOut { attempts: u32 },
}

impl<E> RetryError<E> {
    /// Underlying error of the last attempt, if it did not time out
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Permanent(e) | RetryError::Exhausted { last: e, .. } => Some(e),
            RetryError::TimedOut { .. } => None,
        }
    }
}

/// Exponential backoff with jitter, bounded in attempts and elapsed time
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_elapsed: Duration,
    /// Timeout applied to every single attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// `base * 2^(attempt - 1)` capped at `cap`; attempt numbering starts at 1
pub fn exponential_backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << shift).min(cap)
}

/// Random delay in `[delay / 2, delay]`
pub fn with_jitter(delay: Duration) -> Duration {
    let half = delay / 2;
    let spread = delay.saturating_sub(half).as_millis() as u64;
    if spread == 0 {
        return delay;
    }
    half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

impl RetryPolicy {
    /// No retries; one attempt with the call timeout
    pub fn once(call_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            call_timeout,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        with_jitter(exponential_backoff(
            self.initial_delay,
            self.max_delay,
            attempt,
        ))
    }

    /// Run `call` until it succeeds, fails permanently, or the budget runs out
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, RetryError<E>>
    where
        E: Transient + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_transient() => return Err(RetryError::Permanent(e)),
                Ok(Err(e)) => Some(e),
                Err(_) => None,
            };

            let delay = failure
                .as_ref()
                .and_then(Transient::retry_after)
                .unwrap_or_else(|| self.delay_for(attempt));
            let out_of_budget = attempt >= self.max_attempts
                || start.elapsed() + delay > self.max_elapsed;

            if out_of_budget {
                warn!(
                    operation,
                    attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Giving up on external call"
                );
                return Err(match failure {
                    Some(last) => RetryError::Exhausted {
                        attempts: attempt,
                        last,
                    },
                    None => RetryError::TimedOut { attempts: attempt },
                });
            }

            match &failure {
                Some(e) => debug!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying external call"),
                None => debug!(operation, attempt, delay_ms = delay.as_millis() as u64, "External call timed out, retrying"),
            }
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(transient={})", self.0)
        }
    }

    impl Transient for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(60),
            call_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_exponential_backoff_doubles_to_cap() {
        let base = Duration::from_secs(30);
        let cap = Duration::from_secs(1800);
        assert_eq!(exponential_backoff(base, cap, 1), Duration::from_secs(30));
        assert_eq!(exponential_backoff(base, cap, 2), Duration::from_secs(60));
        assert_eq!(exponential_backoff(base, cap, 6), Duration::from_secs(960));
        assert_eq!(exponential_backoff(base, cap, 7), cap);
        assert_eq!(exponential_backoff(base, cap, 500), cap);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        for _ in 0..100 {
            let d = with_jitter(Duration::from_secs(10));
            assert!(d >= Duration::from_secs(5) && d <= Duration::from_secs(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, RetryError<Flaky>> = policy()
            .run("flaky", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(Flaky(true))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<Flaky>> = policy()
            .run("broken", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(false))
            })
            .await;
        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_capped() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<Flaky>> = policy()
            .run("down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(true))
            })
            .await;
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_calls_time_out() {
        let result: Result<(), RetryError<Flaky>> = policy()
            .run("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(RetryError::TimedOut { attempts: 3 })));
    }
}
