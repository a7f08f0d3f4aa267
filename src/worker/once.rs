use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::{
    error::{Error, Result, StoreError},
    interface::{
        action::Action,
        store::{Metadata, Resource},
    },
    lease::LeaseHandle,
    Coordinator,
};

use super::{PROGRESS_DONE, PROGRESS_KEY};

fn marked_done(metadata: &Metadata) -> bool {
    metadata.get(PROGRESS_KEY).map(String::as_str) == Some(PROGRESS_DONE)
}

impl Coordinator {
    /// Performs `action` once across every caller sharing `resource`, polling
    /// at the configured interval while someone else holds the lease.
    ///
    /// Returns once the completion marker is recorded, by this caller or another.
    pub async fn run_once<A: Action>(&self, resource: &Resource, action: A) -> Result<()> {
        self.run_once_with_poll(resource, action, self.config.poll_interval)
            .await
    }

    #[tracing::instrument(skip_all, fields(resource = %resource))]
    pub async fn run_once_with_poll<A: Action>(
        &self,
        resource: &Resource,
        mut action: A,
        poll_interval: Duration,
    ) -> Result<()> {
        loop {
            if self.is_done(resource).await? {
                debug!("already done");
                return Ok(());
            }

            let mut lease = self.acquire_lease(resource).await?;
            if !lease.has_lease() {
                trace!(?poll_interval, "lease held elsewhere");
                tokio::time::sleep(poll_interval).await;
                continue;
            }

            let outcome = complete_under_lease(&lease, &mut action).await;
            lease.release().await;
            match outcome {
                Ok(true) => {
                    info!("action performed");
                    return Ok(());
                }
                Ok(false) => {
                    debug!("completed by another caller");
                    return Ok(());
                }
                Err(err) if err.is_lease_lost() => {
                    warn!(%err, "lease lost before completion was recorded");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Whether run-once has recorded completion for `resource`.
    pub async fn is_done(&self, resource: &Resource) -> Result<bool> {
        match self.store.get_metadata(resource).await {
            Ok(metadata) => Ok(marked_done(&metadata)),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Returns false when the marker turned up between the unleased check and
/// winning the lease.
async fn complete_under_lease<A: Action>(lease: &LeaseHandle, action: &mut A) -> Result<bool> {
    if marked_done(&lease.metadata().await?) {
        return Ok(false);
    }

    action.perform().await.map_err(Error::Action)?;
    lease
        .update_metadata(|metadata| {
            metadata.insert(PROGRESS_KEY.to_string(), PROGRESS_DONE.to_string());
        })
        .await?;
    Ok(true)
}
