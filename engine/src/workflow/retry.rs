use std::cmp::min;
use std::time::Duration;

use futures::Future;
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::error::{Error, Result};

/// Retry policy applied to every activity invocation.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub maximum_attempts: u32,
    pub maximum_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: 5,
            maximum_interval: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exponential = Duration::from_secs(3_u64.pow(min(attempt, 10)));
        min(exponential, self.maximum_interval)
    }
}

/// Run an activity under `policy` with a per-attempt `start_to_close`
/// timeout. Non-retryable errors (missing rows, missing resources) abort
/// immediately; everything else backs off exponentially up to the policy
/// cap.
pub async fn execute_activity<T, F, Fut>(
    policy: RetryPolicy,
    start_to_close: Duration,
    activity_name: &str,
    mut activity: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;

        let result = match timeout(start_to_close, activity()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ActivityTimeout(start_to_close)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.maximum_attempts => {
                let backoff = policy.backoff(attempt);
                warn!(
                    activity = activity_name,
                    attempt,
                    error = %err,
                    "activity failed, retrying in {}s",
                    backoff.as_secs()
                );
                sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}
