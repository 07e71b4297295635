//! Generic retry with error classification and jittered backoff
//!
//! Every remote call in the engine goes through [`RetryExecutor::execute`].
//! Transient failures are retried with a random sleep between the configured
//! bounds; permanent failures and cancellation surface immediately.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::EngineError;

/// How the executor treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Transient,
    Permanent,
    Cancelled,
}

pub fn classify(err: &EngineError) -> RetryClass {
    match err {
        EngineError::Cancelled | EngineError::Disposed(_) => RetryClass::Cancelled,
        EngineError::ServiceUnavailable(_)
        | EngineError::DiscoveryBusy
        | EngineError::Discovery(_) => RetryClass::Transient,
        // Transport failures are transient unless the backend rejected our
        // credentials outright.
        EngineError::Transport { status, .. } => match status {
            Some(401) => RetryClass::Permanent,
            _ => RetryClass::Transient,
        },
        _ => RetryClass::Permanent,
    }
}

#[derive(Clone)]
pub struct RetryExecutor {
    min_delay: Duration,
    max_delay: Duration,
    cancel: CancelToken,
}

impl RetryExecutor {
    pub fn new(min_delay: Duration, max_delay: Duration, cancel: CancelToken) -> Self {
        Self {
            min_delay,
            max_delay,
            cancel,
        }
    }

    pub fn from_config(config: &EngineConfig, cancel: CancelToken) -> Self {
        Self::new(
            Duration::from_millis(config.retry_min_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
            cancel,
        )
    }

    fn jitter(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Run `body` up to `max_attempts` times. The attempt index (1-based) is
    /// passed to `body` so callers can vary behavior across attempts.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        target: &str,
        max_attempts: u32,
        mut body: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.cancel.check()?;
            let err = match body(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            match classify(&err) {
                RetryClass::Cancelled => return Err(err),
                RetryClass::Permanent => {
                    error!("{} failed for {}: {}", operation, target, err);
                    return Err(err);
                }
                RetryClass::Transient => {
                    if attempt >= max_attempts {
                        error!(
                            "{} failed for {} after {} attempts: {}",
                            operation, target, attempt, err
                        );
                        return Err(err);
                    }
                    warn!(
                        "{} attempt {}/{} failed for {}, retrying: {}",
                        operation, attempt, max_attempts, target, err
                    );
                    self.cancel.sleep(self.jitter()).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn executor() -> RetryExecutor {
        RetryExecutor::new(
            Duration::from_millis(1),
            Duration::from_millis(2),
            CancelToken::new(),
        )
    }

    #[tokio::test]
    async fn test_transient_failure_exhausts_all_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = executor()
            .execute("op", "t", 3, |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::ServiceUnavailable("store down".into())) }
            })
            .await;
        assert!(matches!(result, Err(EngineError::ServiceUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_invokes_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = executor()
            .execute("op", "t", 3, |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(EngineError::Transport {
                        status: Some(401),
                        message: "unauthorized".into(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(EngineError::Transport { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = executor()
            .execute("op", "t", 5, |attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(EngineError::DiscoveryBusy)
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = executor()
            .execute("op", "t", 3, |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::Cancelled) }
            })
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_auth_transport_errors_are_transient() {
        assert_eq!(
            classify(&EngineError::Transport {
                status: Some(503),
                message: "unavailable".into()
            }),
            RetryClass::Transient
        );
        assert_eq!(
            classify(&EngineError::Transport {
                status: None,
                message: "connection reset".into()
            }),
            RetryClass::Transient
        );
        assert_eq!(
            classify(&EngineError::Transport {
                status: Some(401),
                message: "unauthorized".into()
            }),
            RetryClass::Permanent
        );
    }

    #[tokio::test]
    async fn test_unknown_user_is_permanent() {
        assert_eq!(
            classify(&EngineError::UnknownUser("a@x.example".into())),
            RetryClass::Permanent
        );
        assert_eq!(
            classify(&EngineError::InvalidInput("missing".into())),
            RetryClass::Permanent
        );
    }
}
