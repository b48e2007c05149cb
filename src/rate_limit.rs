#![forbid(unsafe_code)]

use rand::RngExt;
use std::{ops::RangeInclusive, time::Duration};
use tokio::{
    sync::Mutex,
    time::{Instant, sleep},
};
use tracing::debug;

pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

const JITTER_SECS: RangeInclusive<f64> = 0.1..=1.0;

/// Enforces a minimum spacing between requests to the remote source.
///
/// The lock is held while waiting, so concurrent callers queue up behind each
/// other and leave one at a time.
#[derive(Debug)]
pub struct RateLimiter {
    delay: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_request: Mutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        let mut last_request = self.last_request.lock().await;
        if let Some(previous) = *last_request {
            let elapsed = previous.elapsed();
            if elapsed < self.delay {
                let wait = self.delay - elapsed + jitter();
                debug!(wait_ms = wait.as_millis() as u64, "rate limiting request");
                sleep(wait).await;
            }
        }
        *last_request = Some(Instant::now());
    }
}

fn jitter() -> Duration {
    Duration::from_secs_f64(rand::rng().random_range(JITTER_SECS))
}
