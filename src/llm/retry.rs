//! Retry policy and failure classification for backend calls
//!
//! Every backend funnels its HTTP attempts through [`with_retry`], which
//! retries transient failures with exponential backoff and turns the final
//! failure into a user-safe [`ModelError`].

use crate::error::{AiErrorKind, ModelError};
use crate::models::ModelAccess;
use rand::Rng;
use std::error::Error as _;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random (0.3 = ±30%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-indexed).
    ///
    /// delay = min(base * 2^retry, max) * (1 ± jitter)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64 * 2f64.powi(retry.min(30) as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let factor = if self.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };

        Duration::from_millis((capped * factor).max(0.0) as u64)
    }

    /// Policy without backoff, for tests that exercise the retry loop.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }
}

/// Raw failure from one attempt. Never leaves the model client layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderFailure {
    Status { status: u16, body: String },
    Timeout(String),
    Connection(String),
    Decode(String),
    MissingCredentials,
    Other(String),
}

impl ProviderFailure {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ProviderFailure::Timeout(err.to_string());
        }
        if err.is_connect() || is_connection_reset(&err) {
            return ProviderFailure::Connection(err.to_string());
        }
        if err.is_decode() {
            return ProviderFailure::Decode(err.to_string());
        }
        if let Some(status) = err.status() {
            return ProviderFailure::Status {
                status: status.as_u16(),
                body: err.to_string(),
            };
        }
        ProviderFailure::Other(err.to_string())
    }

    /// 429, any 5xx, timeouts and dropped connections.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderFailure::Status { status, .. } => *status == 429 || (500..=599).contains(status),
            ProviderFailure::Timeout(_) | ProviderFailure::Connection(_) => true,
            ProviderFailure::Decode(_)
            | ProviderFailure::MissingCredentials
            | ProviderFailure::Other(_) => false,
        }
    }

    pub fn classify(&self) -> AiErrorKind {
        match self {
            ProviderFailure::Status { status: 429, .. } => AiErrorKind::RateLimit,
            ProviderFailure::Status {
                status: 401 | 403, ..
            } => AiErrorKind::AuthError,
            ProviderFailure::Status { status: 408, .. } => AiErrorKind::Timeout,
            ProviderFailure::Status { status, .. } if *status >= 500 => AiErrorKind::ProviderError,
            ProviderFailure::Status { .. } => AiErrorKind::Unknown,
            ProviderFailure::Timeout(_) => AiErrorKind::Timeout,
            ProviderFailure::Connection(_) => AiErrorKind::ProviderError,
            ProviderFailure::MissingCredentials => AiErrorKind::AuthError,
            ProviderFailure::Decode(_) | ProviderFailure::Other(_) => AiErrorKind::Unknown,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderFailure::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn into_model_error(self, backend: ModelAccess) -> ModelError {
        ModelError::new(self.classify(), backend, self.status())
    }
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderFailure::Status { status, body } => write!(f, "HTTP {}: {}", status, body),
            ProviderFailure::Timeout(detail) => write!(f, "timeout: {}", detail),
            ProviderFailure::Connection(detail) => write!(f, "connection: {}", detail),
            ProviderFailure::Decode(detail) => write!(f, "decode: {}", detail),
            ProviderFailure::MissingCredentials => f.write_str("API key not configured"),
            ProviderFailure::Other(detail) => f.write_str(detail),
        }
    }
}

fn is_connection_reset(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        source = cause.source();
    }
    false
}

/// Run `attempt` until it succeeds, fails permanently, or the policy is
/// exhausted. Raw failures are logged here and nowhere else.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    backend: ModelAccess,
    mut attempt: F,
) -> Result<T, ModelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderFailure>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut tries = 0;

    loop {
        tries += 1;

        let failure = match attempt().await {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };

        if failure.is_retryable() && tries < max_attempts {
            let delay = policy.delay_for(tries - 1);
            warn!(
                backend = %backend,
                attempt = tries,
                delay_ms = delay.as_millis() as u64,
                failure = %failure,
                "transient backend error, will retry"
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        let kind = failure.classify();
        error!(
            backend = %backend,
            attempts = tries,
            kind = %kind,
            failure = %failure,
            "backend request failed"
        );
        return Err(failure.into_model_error(backend));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn status(code: u16) -> ProviderFailure {
        ProviderFailure::Status {
            status: code,
            body: "upstream said no".to_string(),
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(status(429).is_retryable());
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(ProviderFailure::Timeout("t".into()).is_retryable());
        assert!(ProviderFailure::Connection("reset".into()).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(!ProviderFailure::Decode("bad json".into()).is_retryable());
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(status(429).classify(), AiErrorKind::RateLimit);
        assert_eq!(status(401).classify(), AiErrorKind::AuthError);
        assert_eq!(status(403).classify(), AiErrorKind::AuthError);
        assert_eq!(status(502).classify(), AiErrorKind::ProviderError);
        assert_eq!(
            ProviderFailure::Timeout("slow".into()).classify(),
            AiErrorKind::Timeout
        );
        assert_eq!(status(418).classify(), AiErrorKind::Unknown);
        assert_eq!(
            ProviderFailure::MissingCredentials.classify(),
            AiErrorKind::AuthError
        );
    }

    #[test]
    fn test_delay_is_capped_and_jittered() {
        let policy = RetryPolicy::default();
        for _ in 0..20 {
            let first = policy.delay_for(0).as_millis();
            assert!((700..=1300).contains(&first), "first delay {}", first);

            let late = policy.delay_for(10).as_millis();
            assert!((7000..=13_000).contains(&late), "late delay {}", late);
        }
    }

    #[tokio::test]
    async fn test_recovers_after_two_transient_failures() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            jitter: 0.3,
        };
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = with_retry(&policy, ModelAccess::Reasoning, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(status(503))
                } else {
                    Ok("answer")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "answer");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 20ms and 40ms backoffs, each at worst 30% short.
        assert!(started.elapsed() >= Duration::from_millis(42));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&RetryPolicy::immediate(3), ModelAccess::Cfo, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(status(401)) }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, AiErrorKind::AuthError);
        assert_eq!(err.backend, ModelAccess::Cfo);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!err.to_string().contains("upstream said no"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_classified_error() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&RetryPolicy::immediate(3), ModelAccess::Fast, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(status(429)) }
        })
        .await;

        assert_eq!(result.unwrap_err().kind, AiErrorKind::RateLimit);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
