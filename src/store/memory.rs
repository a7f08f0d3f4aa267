//! In-process [`LeaseStore`] with the lease semantics of a blob store.
//!
//! Lease expiry is measured on tokio's clock, so tests running with paused time
//! can step straight past a lease duration.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    error::{StoreError, StoreResult},
    interface::store::{LeaseId, LeaseStore, Metadata, Resource},
};

struct ActiveLease {
    id: LeaseId,
    duration: Duration,
    expires_at: Instant,
}

impl ActiveLease {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Default)]
struct Entry {
    metadata: Metadata,
    lease: Option<ActiveLease>,
}

impl Entry {
    fn live_lease(&self) -> Option<&ActiveLease> {
        self.lease.as_ref().filter(|lease| !lease.is_expired())
    }
}

#[derive(Default)]
struct State {
    containers: HashSet<String>,
    entries: HashMap<Resource, Entry>,
    failures: HashMap<&'static str, StoreError>,
}

impl State {
    fn take_failure(&mut self, operation: &'static str) -> StoreResult<()> {
        match self.failures.remove(operation) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn entry(&mut self, resource: &Resource) -> StoreResult<&mut Entry> {
        self.entries
            .get_mut(resource)
            .ok_or_else(|| StoreError::NotFound(resource.clone()))
    }
}

/// Clones share the same underlying state, standing in for one remote store
/// seen by many processes.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call to `operation` (a [`LeaseStore`] method name) fail with `error`.
    pub async fn fail_next(&self, operation: &'static str, error: StoreError) {
        self.state.lock().await.failures.insert(operation, error);
    }
}

#[async_trait]
impl LeaseStore for InMemoryStore {
    async fn create_container_if_not_exists(&self, resource: &Resource) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.take_failure("create_container_if_not_exists")?;
        state.containers.insert(resource.container.clone());
        Ok(())
    }

    async fn create_exclusive(&self, resource: &Resource) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.take_failure("create_exclusive")?;
        if !state.containers.contains(&resource.container) {
            return Err(StoreError::NotFound(resource.clone()));
        }
        if let Some(entry) = state.entries.get(resource) {
            return Err(if entry.live_lease().is_some() {
                StoreError::Locked(resource.clone())
            } else {
                StoreError::AlreadyExists(resource.clone())
            });
        }
        state.entries.insert(resource.clone(), Entry::default());
        Ok(())
    }

    async fn exists(&self, resource: &Resource) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        state.take_failure("exists")?;
        Ok(state.entries.contains_key(resource))
    }

    async fn acquire_lease(&self, resource: &Resource, duration: Duration) -> StoreResult<LeaseId> {
        let mut state = self.state.lock().await;
        state.take_failure("acquire_lease")?;
        let entry = state.entry(resource)?;
        if entry.live_lease().is_some() {
            return Err(StoreError::Conflict(resource.clone()));
        }

        let id = LeaseId::generate();
        entry.lease = Some(ActiveLease {
            id: id.clone(),
            duration,
            expires_at: Instant::now() + duration,
        });
        Ok(id)
    }

    async fn renew_lease(&self, resource: &Resource, lease_id: &LeaseId) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.take_failure("renew_lease")?;
        // An expired lease nobody else took can still be renewed by its holder
        match &mut state.entry(resource)?.lease {
            Some(lease) if lease.id == *lease_id => {
                lease.expires_at = Instant::now() + lease.duration;
                Ok(())
            }
            _ => Err(StoreError::Conflict(resource.clone())),
        }
    }

    async fn release_lease(&self, resource: &Resource, lease_id: &LeaseId) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.take_failure("release_lease")?;
        let entry = state.entry(resource)?;
        if !matches!(&entry.lease, Some(lease) if lease.id == *lease_id) {
            return Err(StoreError::Conflict(resource.clone()));
        }
        entry.lease = None;
        Ok(())
    }

    async fn break_lease(&self, resource: &Resource) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.take_failure("break_lease")?;
        state.entry(resource)?.lease = None;
        Ok(())
    }

    async fn get_metadata(&self, resource: &Resource) -> StoreResult<Metadata> {
        let mut state = self.state.lock().await;
        state.take_failure("get_metadata")?;
        Ok(state.entry(resource)?.metadata.clone())
    }

    async fn set_metadata(
        &self,
        resource: &Resource,
        metadata: Metadata,
        lease_id: &LeaseId,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.take_failure("set_metadata")?;
        let entry = state.entry(resource)?;
        if !matches!(entry.live_lease(), Some(lease) if lease.id == *lease_id) {
            return Err(StoreError::PreconditionFailed(resource.clone()));
        }
        entry.metadata = metadata;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(90);

    async fn created(store: &InMemoryStore, resource: &Resource) {
        store.create_container_if_not_exists(resource).await.unwrap();
        store.create_exclusive(resource).await.unwrap();
    }

    #[tokio::test]
    async fn exclusive_create_reports_existing_and_locked() {
        let store = InMemoryStore::new();
        let resource = Resource::new("jobs", "report");
        assert!(matches!(
            store.create_exclusive(&resource).await,
            Err(StoreError::NotFound(_))
        ));

        created(&store, &resource).await;
        assert!(matches!(
            store.create_exclusive(&resource).await,
            Err(StoreError::AlreadyExists(_))
        ));

        store.acquire_lease(&resource, LEASE).await.unwrap();
        assert!(matches!(
            store.create_exclusive(&resource).await,
            Err(StoreError::Locked(_))
        ));
    }

    #[tokio::test]
    async fn acquiring_a_missing_resource_is_not_found() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store
                .acquire_lease(&Resource::new("jobs", "missing"), LEASE)
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unrenewed_lease_expires() {
        let store = InMemoryStore::new();
        let resource = Resource::new("jobs", "report");
        created(&store, &resource).await;

        let first = store.acquire_lease(&resource, LEASE).await.unwrap();
        tokio::time::sleep(Duration::from_secs(89)).await;
        assert!(matches!(
            store.acquire_lease(&resource, LEASE).await,
            Err(StoreError::Conflict(_))
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = store.acquire_lease(&resource, LEASE).await.unwrap();
        assert_ne!(first, second);
        assert!(matches!(
            store.renew_lease(&resource, &first).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_pushes_expiry_out() {
        let store = InMemoryStore::new();
        let resource = Resource::new("jobs", "report");
        created(&store, &resource).await;

        let lease = store.acquire_lease(&resource, LEASE).await.unwrap();
        tokio::time::sleep(Duration::from_secs(80)).await;
        store.renew_lease(&resource, &lease).await.unwrap();
        tokio::time::sleep(Duration::from_secs(80)).await;
        assert!(matches!(
            store.acquire_lease(&resource, LEASE).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn writes_with_a_stale_lease_are_rejected() {
        let store = InMemoryStore::new();
        let resource = Resource::new("jobs", "report");
        created(&store, &resource).await;

        let stale = store.acquire_lease(&resource, LEASE).await.unwrap();
        store.release_lease(&resource, &stale).await.unwrap();

        let mut metadata = Metadata::new();
        metadata.insert("progress".to_string(), "done".to_string());
        assert!(matches!(
            store.set_metadata(&resource, metadata.clone(), &stale).await,
            Err(StoreError::PreconditionFailed(_))
        ));

        let current = store.acquire_lease(&resource, LEASE).await.unwrap();
        tokio::time::sleep(LEASE).await;
        assert!(matches!(
            store.set_metadata(&resource, metadata.clone(), &current).await,
            Err(StoreError::PreconditionFailed(_))
        ));
        assert!(store.get_metadata(&resource).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn break_frees_the_resource() {
        let store = InMemoryStore::new();
        let resource = Resource::new("jobs", "report");
        created(&store, &resource).await;

        let held = store.acquire_lease(&resource, LEASE).await.unwrap();
        store.break_lease(&resource).await.unwrap();
        assert!(matches!(
            store.release_lease(&resource, &held).await,
            Err(StoreError::Conflict(_))
        ));
        store.acquire_lease(&resource, LEASE).await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let store = InMemoryStore::new();
        let resource = Resource::new("jobs", "report");
        store
            .fail_next("exists", StoreError::Transient("reset".to_string()))
            .await;
        assert!(store.exists(&resource).await.is_err());
        assert!(!store.exists(&resource).await.unwrap());
    }
}
