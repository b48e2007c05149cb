#![forbid(unsafe_code)]

//! Retry and fallback across the extraction engines.
//!
//! Every attempt goes through the shared rate limiter and the primary engine
//! with the default identity. A challenge is retried at once with the rotated
//! identity. The last attempt additionally hands the operation to the
//! fallback engine; earlier attempts back off linearly.

use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{ClientIdentity, ExtractionBackend, MaterializeRequest},
    error::{FetchError, FetchResult, Operation},
    models::{ProgressSink, VideoMetadata},
    rate_limit::RateLimiter,
};

pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay after the first failed attempt; later attempts wait a multiple.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            base_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_add(1))
    }
}

pub struct Orchestrator {
    primary: Arc<dyn ExtractionBackend>,
    fallback: Arc<dyn ExtractionBackend>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        primary: Arc<dyn ExtractionBackend>,
        fallback: Arc<dyn ExtractionBackend>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            primary,
            fallback,
            limiter,
            policy,
        }
    }

    pub async fn fetch_metadata(&self, url: &str) -> FetchResult<VideoMetadata> {
        self.run(Operation::Metadata, url, |backend, identity| async move {
            backend.fetch_metadata(url, identity).await
        })
        .await
    }

    /// Puts the requested media on disk. A reported path that does not exist
    /// counts as a failed attempt.
    pub async fn materialize(
        &self,
        request: &MaterializeRequest,
        progress: Arc<dyn ProgressSink>,
    ) -> FetchResult<PathBuf> {
        self.run(
            Operation::from(request.kind),
            &request.url,
            |backend, identity| {
                let progress = progress.clone();
                async move {
                    let path = backend
                        .fetch_and_store(request, identity, progress)
                        .await?;
                    match tokio::fs::metadata(&path).await {
                        Ok(meta) if meta.is_file() => Ok(path),
                        _ => Err(FetchError::ExtractionFailed(format!(
                            "{} reported {} but no such file exists",
                            backend.name(),
                            path.display()
                        ))),
                    }
                }
            },
        )
        .await
    }

    async fn run<T, F, Fut>(&self, operation: Operation, url: &str, invoke: F) -> FetchResult<T>
    where
        F: Fn(Arc<dyn ExtractionBackend>, ClientIdentity) -> Fut,
        Fut: Future<Output = FetchResult<T>>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            self.limiter.acquire().await;
            debug!(
                %operation,
                url,
                attempt = attempt + 1,
                backend = self.primary.name(),
                identity = ClientIdentity::Default.as_str(),
                "starting attempt"
            );
            let failure = match invoke(self.primary.clone(), ClientIdentity::Default).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };
            warn!(
                %operation,
                url,
                attempt = attempt + 1,
                backend = self.primary.name(),
                identity = ClientIdentity::Default.as_str(),
                error = %failure,
                "attempt failed"
            );

            let failure = if matches!(failure, FetchError::ChallengeDetected(_)) {
                info!(
                    %operation,
                    url,
                    attempt = attempt + 1,
                    backend = self.primary.name(),
                    identity = ClientIdentity::Rotated.as_str(),
                    "challenge detected, retrying with rotated identity"
                );
                match invoke(self.primary.clone(), ClientIdentity::Rotated).await {
                    Ok(value) => return Ok(value),
                    Err(err) if !err.is_retryable() => return Err(err),
                    Err(err) => {
                        warn!(
                            %operation,
                            url,
                            attempt = attempt + 1,
                            backend = self.primary.name(),
                            identity = ClientIdentity::Rotated.as_str(),
                            error = %err,
                            "rotated identity failed"
                        );
                        err
                    }
                }
            } else {
                failure
            };
            last_error = Some(failure);

            if attempt + 1 == attempts {
                info!(
                    %operation,
                    url,
                    attempt = attempt + 1,
                    backend = self.fallback.name(),
                    identity = ClientIdentity::Default.as_str(),
                    "switching to fallback backend"
                );
                self.limiter.acquire().await;
                match invoke(self.fallback.clone(), ClientIdentity::Default).await {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        error!(
                            %operation,
                            url,
                            backend = self.fallback.name(),
                            error = %err,
                            "fallback backend failed"
                        );
                        last_error = Some(err);
                    }
                }
            } else {
                let delay = self.policy.delay_for_attempt(attempt);
                info!(
                    %operation,
                    url,
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs_f64(),
                    "backing off before next attempt"
                );
                sleep(delay).await;
            }
        }

        Err(FetchError::DownloadFailed {
            operation,
            url: url.to_string(),
            reason: last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no attempt was made".to_string()),
        })
    }
}
