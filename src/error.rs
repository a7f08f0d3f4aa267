use thiserror::Error;

use crate::Resource;

pub type Result<T> = std::result::Result<T, Error>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures reported by a [`LeaseStore`](crate::interface::store::LeaseStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// An exclusive create found the resource already present.
    #[error("resource {0} already exists")]
    AlreadyExists(Resource),

    /// The resource is leased and the request carried no matching lease id.
    #[error("resource {0} is locked by a lease")]
    Locked(Resource),

    /// Another caller holds the lease, or the supplied lease id does not match.
    #[error("lease conflict on {0}")]
    Conflict(Resource),

    /// A conditioned write was rejected because the lease is not held by the given id.
    #[error("precondition failed on {0}")]
    PreconditionFailed(Resource),

    #[error("resource {0} not found")]
    NotFound(Resource),

    /// Throttling, timeouts and other failures worth another attempt.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("unexpected store failure: {0}")]
    Unexpected(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The handle's renewal failed, so it no longer trusts its lease id.
    #[error("lease on {0} was lost")]
    LeaseLost(Resource),

    #[error("action failed: {0:#}")]
    Action(anyhow::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid resource name: {0}")]
    InvalidResource(String),
}

impl Error {
    /// True when a conditioned write failed only because the lease went away.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            Error::LeaseLost(_) | Error::Store(StoreError::PreconditionFailed(_))
        )
    }
}
