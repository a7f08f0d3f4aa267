//! Run-once and run-periodically coordination between competing processes,
//! built on nothing but the leases and metadata of a shared object store.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

pub mod config;
pub mod error;
pub mod interface;
pub mod lease;
pub mod store;
pub mod util;
mod worker;

pub use config::{CoordinatorConfig, DynamoConfig};
pub use error::{Error, Result, StoreError, StoreResult};
pub use interface::{
    action::Action,
    store::{LeaseId, LeaseStore, Metadata, Resource},
};
pub use lease::LeaseHandle;
pub use util::clock::{Clock, SystemClock, TokioClock};

/// Entry point for lease-scoped work against one store.
///
/// Cheap to clone; clones share the store handle, configuration and clock.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn LeaseStore>,
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self {
            store,
            config: CoordinatorConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_config(store: Arc<dyn LeaseStore>, config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new(store)
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Makes one attempt at leasing `resource`, creating it first if needed.
    ///
    /// The caller owns the handle and must [`release`](LeaseHandle::release) it.
    pub async fn acquire_lease(&self, resource: &Resource) -> Result<LeaseHandle> {
        LeaseHandle::acquire(self.store.clone(), resource.clone(), &self.config).await
    }

    /// Runs `f` with a lease attempt on `resource` and releases the lease on
    /// every exit path, including when `f` fails.
    ///
    /// `f` is called even when the lease went elsewhere; check
    /// [`LeaseHandle::has_lease`].
    pub async fn with_lease<T, F>(&self, resource: &Resource, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut LeaseHandle) -> BoxFuture<'a, Result<T>>,
    {
        let mut lease = self.acquire_lease(resource).await?;
        let result = f(&mut lease).await;
        lease.release().await;
        result
    }

    /// Ends whatever lease is held on `resource`, whoever holds it.
    pub async fn break_lease(&self, resource: &Resource) -> Result<()> {
        self.store.break_lease(resource).await?;
        info!(%resource, "broke lease");
        Ok(())
    }
}
