use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Waits `delay`, runs `runnable` once, and repeats until cancelled or until
/// `run_once` asks to stop.
///
/// Cancellation is only observed while waiting, so a run in progress always
/// finishes before this returns.
pub(crate) async fn run_with_fixed_delay<T: PeriodicRunnable + ?Sized>(
    runnable: Arc<T>,
    delay: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        if !runnable.run_once().await {
            break;
        }
    }
}

#[async_trait]
pub(crate) trait PeriodicRunnable: Send + Sync {
    /// Returns false to end the loop.
    async fn run_once(&self) -> bool;
}
