use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    interface::store::{LeaseId, LeaseStore, Resource},
    util::runnable::PeriodicRunnable,
};

/// Keeps one held lease alive until its handle cancels it.
pub(crate) struct LeaseRenewer {
    store: Arc<dyn LeaseStore>,
    resource: Resource,
    lease_id: LeaseId,
    lost: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl LeaseRenewer {
    pub(crate) fn new(
        store: Arc<dyn LeaseStore>,
        resource: Resource,
        lease_id: LeaseId,
        lost: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            resource,
            lease_id,
            lost,
            cancel,
        }
    }
}

#[async_trait]
impl PeriodicRunnable for LeaseRenewer {
    async fn run_once(&self) -> bool {
        match self.store.renew_lease(&self.resource, &self.lease_id).await {
            Ok(()) => {
                trace!(resource = %self.resource, "renewed lease");
                true
            }
            Err(err) if self.cancel.is_cancelled() => {
                // The handle let go while this renewal was in flight.
                debug!(resource = %self.resource, %err, "renewal after release");
                false
            }
            Err(err) => {
                warn!(resource = %self.resource, %err, "lease renewal failed, giving up the lease");
                self.lost.store(true, Ordering::SeqCst);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{error::StoreError, store::memory::InMemoryStore};

    fn report() -> Resource {
        Resource::new("jobs", "report")
    }

    async fn leased(store: &InMemoryStore) -> LeaseId {
        store.create_container_if_not_exists(&report()).await.unwrap();
        store.create_exclusive(&report()).await.unwrap();
        store
            .acquire_lease(&report(), Duration::from_secs(90))
            .await
            .unwrap()
    }

    fn renewer(
        store: &InMemoryStore,
        lease_id: LeaseId,
    ) -> (LeaseRenewer, Arc<AtomicBool>, CancellationToken) {
        let lost = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let renewer = LeaseRenewer::new(
            Arc::new(store.clone()),
            report(),
            lease_id,
            lost.clone(),
            cancel.clone(),
        );
        (renewer, lost, cancel)
    }

    #[tokio::test]
    async fn keeps_going_while_renewals_succeed() {
        let store = InMemoryStore::new();
        let (renewer, lost, _cancel) = renewer(&store, leased(&store).await);

        assert!(renewer.run_once().await);
        assert!(!lost.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failure_after_release_is_swallowed() {
        let store = InMemoryStore::new();
        let (renewer, lost, cancel) = renewer(&store, leased(&store).await);
        store
            .fail_next("renew_lease", StoreError::Conflict(report()))
            .await;

        cancel.cancel();
        assert!(!renewer.run_once().await);
        assert!(!lost.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn rejected_renewal_marks_the_lease_lost() {
        let store = InMemoryStore::new();
        let (renewer, lost, _cancel) = renewer(&store, leased(&store).await);
        store.break_lease(&report()).await.unwrap();

        assert!(!renewer.run_once().await);
        assert!(lost.load(Ordering::SeqCst));
    }
}
