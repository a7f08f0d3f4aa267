use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::CoordinatorConfig,
    error::{Error, Result, StoreError},
    interface::store::{LeaseId, LeaseStore, Metadata, Resource},
    util::runnable::run_with_fixed_delay,
};

use super::renewer::LeaseRenewer;

struct Renewal {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// An attempt at exclusive ownership of one resource.
///
/// When the attempt succeeds the lease is renewed in the background until
/// [`release`](LeaseHandle::release) is awaited. Dropping an unreleased handle
/// stops renewal and schedules a best-effort release on the current runtime, but
/// callers should release explicitly (or use
/// [`Coordinator::with_lease`](crate::Coordinator::with_lease)).
pub struct LeaseHandle {
    store: Arc<dyn LeaseStore>,
    resource: Resource,
    lease_id: Option<LeaseId>,
    renewal: Option<Renewal>,
    lost: Arc<AtomicBool>,
    released: bool,
}

impl LeaseHandle {
    /// Creates the resource if needed and tries once to lease it.
    ///
    /// Losing the race to another holder is not an error: the handle comes back
    /// with `has_lease() == false`.
    #[tracing::instrument(skip_all, fields(resource = %resource))]
    pub(crate) async fn acquire(
        store: Arc<dyn LeaseStore>,
        resource: Resource,
        config: &CoordinatorConfig,
    ) -> Result<Self> {
        store.create_container_if_not_exists(&resource).await?;
        match store.create_exclusive(&resource).await {
            Ok(()) => debug!("created resource"),
            // Someone else created it first, or holds it leased already
            Err(StoreError::AlreadyExists(_)) | Err(StoreError::Locked(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let lease_id = match store.acquire_lease(&resource, config.lease_duration).await {
            Ok(lease_id) => Some(lease_id),
            Err(StoreError::Conflict(_)) => None,
            Err(err) => return Err(err.into()),
        };

        let lost = Arc::new(AtomicBool::new(false));
        let renewal = lease_id.as_ref().map(|lease_id| {
            let cancel = CancellationToken::new();
            let renewer = Arc::new(LeaseRenewer::new(
                store.clone(),
                resource.clone(),
                lease_id.clone(),
                lost.clone(),
                cancel.clone(),
            ));
            let task = tokio::spawn(run_with_fixed_delay(
                renewer,
                config.renewal_period,
                cancel.clone(),
            ));
            Renewal { cancel, task }
        });
        debug!(acquired = lease_id.is_some(), "lease attempt");

        Ok(Self {
            store,
            resource,
            lease_id,
            renewal,
            lost,
            released: false,
        })
    }

    /// Whether the acquisition attempt won the lease.
    pub fn has_lease(&self) -> bool {
        self.lease_id.is_some()
    }

    /// Whether conditioned writes can still be attempted: the lease was won,
    /// has not been released, and no renewal or write has been rejected since.
    pub fn is_valid(&self) -> bool {
        self.has_lease() && !self.released && !self.lost.load(Ordering::SeqCst)
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn lease_id(&self) -> Option<&LeaseId> {
        self.lease_id.as_ref()
    }

    fn active_lease_id(&self) -> Result<&LeaseId> {
        match &self.lease_id {
            Some(lease_id) if self.is_valid() => Ok(lease_id),
            _ => Err(Error::LeaseLost(self.resource.clone())),
        }
    }

    /// Current metadata of the resource. Reads are not conditioned on the lease.
    pub async fn metadata(&self) -> Result<Metadata> {
        Ok(self.store.get_metadata(&self.resource).await?)
    }

    /// Replaces the resource's metadata, conditioned on this handle's lease.
    pub async fn set_metadata(&self, metadata: Metadata) -> Result<()> {
        let lease_id = self.active_lease_id()?;
        match self
            .store
            .set_metadata(&self.resource, metadata, lease_id)
            .await
        {
            Err(StoreError::PreconditionFailed(resource)) => {
                self.lost.store(true, Ordering::SeqCst);
                Err(StoreError::PreconditionFailed(resource).into())
            }
            result => Ok(result?),
        }
    }

    /// Reads the metadata, applies `update`, and writes the result back under the lease.
    pub async fn update_metadata<F>(&self, update: F) -> Result<Metadata>
    where
        F: FnOnce(&mut Metadata),
    {
        self.active_lease_id()?;
        let mut metadata = self.metadata().await?;
        update(&mut metadata);
        self.set_metadata(metadata.clone()).await?;
        Ok(metadata)
    }

    /// Renews right away instead of waiting for the background loop.
    ///
    /// Returns `Ok(false)` when the store no longer recognises the lease.
    pub async fn renew(&self) -> Result<bool> {
        let lease_id = self.active_lease_id()?;
        match self.store.renew_lease(&self.resource, lease_id).await {
            Ok(()) => Ok(true),
            Err(StoreError::Conflict(_)) => {
                self.lost.store(true, Ordering::SeqCst);
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Stops renewal, then releases the lease. Safe to call more than once.
    ///
    /// Release is best effort: a failure is logged and the lease is left to expire.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(renewal) = self.renewal.take() {
            renewal.cancel.cancel();
            if let Err(err) = renewal.task.await {
                warn!(resource = %self.resource, ?err, "renewal task did not shut down cleanly");
            }
        }

        if let Some(lease_id) = &self.lease_id {
            match self.store.release_lease(&self.resource, lease_id).await {
                Ok(()) => debug!(resource = %self.resource, "released lease"),
                Err(err) => warn!(resource = %self.resource, %err, "releasing lease"),
            }
        }
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let renewal = match self.renewal.take() {
            Some(renewal) => renewal,
            None => return,
        };
        renewal.cancel.cancel();

        let lease_id = match self.lease_id.take() {
            Some(lease_id) => lease_id,
            None => return,
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let store = self.store.clone();
                let resource = self.resource.clone();
                runtime.spawn(async move {
                    if let Err(err) = renewal.task.await {
                        warn!(%resource, ?err, "renewal task did not shut down cleanly");
                    }
                    if let Err(err) = store.release_lease(&resource, &lease_id).await {
                        warn!(%resource, %err, "releasing dropped lease");
                    }
                });
            }
            Err(_) => {
                warn!(resource = %self.resource, "lease dropped outside a runtime, leaving it to expire");
            }
        }
    }
}
