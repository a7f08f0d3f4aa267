use std::future::Future;

use async_trait::async_trait;

/// Work coordinated by the run-once and run-periodically loops.
///
/// Any `FnMut() -> impl Future<Output = anyhow::Result<()>>` closure is an action.
/// Run-once may repeat an action whose holder crashed before recording
/// completion, so actions with side effects should be safe to repeat.
#[async_trait]
pub trait Action: Send {
    async fn perform(&mut self) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Action for F
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn perform(&mut self) -> anyhow::Result<()> {
        (self)().await
    }
}
