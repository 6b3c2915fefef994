use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::warn;

use crate::error::ServiceError;

pub(crate) const DEFAULT_MAX_ATTEMPTS: usize = 5;
pub(crate) const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

pub(crate) fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    let code = status.as_u16();
    if code == 529 || code == 503 {
        return true;
    }
    let lower = body.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("resource_exhausted")
        || lower.contains("quota")
        || lower.contains("overloaded")
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    None
}

/// Maps a failed HTTP exchange onto the service error kinds.
pub(crate) fn classify_failure(
    provider: &'static str,
    status: StatusCode,
    body: &str,
    message: String,
    retry_after: Option<Duration>,
) -> ServiceError {
    let code = status.as_u16();
    if is_rate_limited(status, body) {
        ServiceError::RateLimited {
            provider,
            status: code,
            message,
            retry_after,
        }
    } else if status.is_server_error() || code == 408 {
        ServiceError::Server {
            provider,
            status: code,
            message,
        }
    } else {
        ServiceError::Rejected {
            provider,
            status: code,
            message,
        }
    }
}

/// Outcome of one attempt at a retried operation.
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),
    Retryable {
        error: anyhow::Error,
        retry_after: Option<Duration>,
    },
    /// Further attempts would fail the same way.
    Fatal(anyhow::Error),
}

impl<T> Attempt<T> {
    pub fn from_service_error(error: ServiceError) -> Self {
        if error.is_retryable() {
            Attempt::Retryable {
                retry_after: error.retry_after(),
                error: error.into(),
            }
        } else {
            Attempt::Fatal(error.into())
        }
    }

    pub fn retryable(error: anyhow::Error) -> Self {
        Attempt::Retryable {
            error,
            retry_after: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given 1-based failed attempt: the base delay,
    /// doubled per attempt, capped at the maximum.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as u32;
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(exponent));
        delay.min(self.max_delay)
    }

    /// A server-provided `Retry-After` raises the wait but never lowers it,
    /// and never past `max_delay`.
    pub fn wait_for(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay_for(attempt);
        match retry_after {
            Some(retry_after) if retry_after > delay => retry_after.min(self.max_delay),
            _ => delay,
        }
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Runs `operation` until it succeeds, fails fatally, or the policy's
/// attempts are used up. Returns the last error on failure.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    label: &str,
    mut operation: F,
) -> anyhow::Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match operation(attempt).await {
            Attempt::Success(value) => return Ok(value),
            Attempt::Fatal(error) => {
                warn!("{}: giving up after a non-retryable error: {:#}", label, error);
                return Err(error);
            }
            Attempt::Retryable { error, retry_after } => {
                if attempt >= max_attempts {
                    warn!(
                        "{}: giving up after {} attempts: {:#}",
                        label, attempt, error
                    );
                    return Err(error);
                }
                let wait = policy.wait_for(attempt, retry_after);
                warn!(
                    "{}: {:#}; retrying in {:.1}s (attempt {}/{})",
                    label,
                    error,
                    wait.as_secs_f32(),
                    attempt,
                    max_attempts
                );
                sleeper.sleep(wait).await;
            }
        }
    }
}
