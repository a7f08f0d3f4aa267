use std::time::Duration;

use futures_retry::{ErrorHandler, RetryPolicy};
use tracing::warn;

use crate::error::StoreError;

pub(crate) struct FixedCountWithDelayStrategy {
    max_attempts: usize,
    delay: Duration,
}

impl FixedCountWithDelayStrategy {
    pub(crate) fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl ErrorHandler<StoreError> for FixedCountWithDelayStrategy {
    type OutError = StoreError;

    fn handle(&mut self, attempt: usize, e: StoreError) -> RetryPolicy<StoreError> {
        if attempt >= self.max_attempts || !e.is_retryable() {
            return RetryPolicy::ForwardError(e);
        }

        warn!(attempt, err = %e, "retrying store request");
        RetryPolicy::WaitRetry(self.delay)
    }
}
