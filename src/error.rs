//! Typed errors for the seams where callers branch on the failure kind.
//!
//! Everything else flows through `anyhow` with context.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A required input is missing or unusable. Stages abort before writing
/// any output when they hit one of these.
#[derive(Error, Debug)]
pub enum PreconditionError {
    #[error("source document not found: {0}")]
    MissingSource(PathBuf),

    #[error("failed to open source document {path}: {reason}")]
    UnreadableSource { path: PathBuf, reason: String },

    #[error("font file for {role} not found: {path}")]
    MissingFont { role: &'static str, path: PathBuf },

    #[error("checkpoint not found: {0}")]
    MissingCheckpoint(PathBuf),

    #[error("no API key found for provider {0}")]
    MissingCredential(&'static str),
}

/// Failure reported by a translation service call.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{provider} rate limited ({status}): {message}")]
    RateLimited {
        provider: &'static str,
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("{provider} server error ({status}): {message}")]
    Server {
        provider: &'static str,
        status: u16,
        message: String,
    },

    #[error("{provider} rejected the request ({status}): {message}")]
    Rejected {
        provider: &'static str,
        status: u16,
        message: String,
    },

    #[error("{provider} request failed: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },

    #[error("{provider} returned a malformed response: {message}")]
    Malformed {
        provider: &'static str,
        message: String,
    },
}

impl ServiceError {
    /// Authentication and request-shape errors will fail the same way on
    /// every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ServiceError::Rejected { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ServiceError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rejections_are_fatal() {
        let rejected = ServiceError::Rejected {
            provider: "openai",
            status: 401,
            message: "invalid key".to_string(),
        };
        let limited = ServiceError::RateLimited {
            provider: "openai",
            status: 429,
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert!(!rejected.is_retryable());
        assert!(limited.is_retryable());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(rejected.retry_after(), None);
    }
}
