use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use async_trait::async_trait;

use crate::error::{Error, StoreResult};

/// String-keyed metadata record kept alongside every resource.
pub type Metadata = HashMap<String, String>;

/// A leasable record, addressed as `container/name`.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct Resource {
    pub container: String,
    pub name: String,
}

impl Resource {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

impl FromStr for Resource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((container, name)) if !container.is_empty() && !name.is_empty() => {
                Ok(Resource::new(container, name))
            }
            _ => Err(Error::InvalidResource(format!(
                "'{}' is not of the form container/name",
                s
            ))),
        }
    }
}

/// Opaque lease token issued by the store on acquisition.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct LeaseId(String);

impl LeaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A random 128-bit id, for backends where the client proposes the lease id.
    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The capabilities a lease-capable object store has to offer.
///
/// Every call is a network round trip for remote backends. Implementations must
/// make `acquire_lease` atomic: of any number of concurrent acquirers, at most
/// one receives a lease id and the rest get [`StoreError::Conflict`].
///
/// [`StoreError::Conflict`]: crate::StoreError::Conflict
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Idempotently creates the container that holds the resource.
    async fn create_container_if_not_exists(&self, resource: &Resource) -> StoreResult<()>;

    /// Creates an empty resource, failing with `AlreadyExists` when present
    /// and `Locked` when present and leased.
    async fn create_exclusive(&self, resource: &Resource) -> StoreResult<()>;

    async fn exists(&self, resource: &Resource) -> StoreResult<bool>;

    async fn acquire_lease(&self, resource: &Resource, duration: Duration) -> StoreResult<LeaseId>;

    async fn renew_lease(&self, resource: &Resource, lease_id: &LeaseId) -> StoreResult<()>;

    async fn release_lease(&self, resource: &Resource, lease_id: &LeaseId) -> StoreResult<()>;

    /// Ends whatever lease is active on the resource, regardless of holder.
    async fn break_lease(&self, resource: &Resource) -> StoreResult<()>;

    async fn get_metadata(&self, resource: &Resource) -> StoreResult<Metadata>;

    /// Replaces the metadata, only if `lease_id` holds the active lease.
    async fn set_metadata(
        &self,
        resource: &Resource,
        metadata: Metadata,
        lease_id: &LeaseId,
    ) -> StoreResult<()>;
}
