use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    error::{Error, Result, StoreError},
    interface::{action::Action, store::Resource},
    lease::LeaseHandle,
    util::{format_http_date, parse_http_date},
    Coordinator,
};

use super::LAST_PERFORMED_KEY;

/// Stands in for a resource that has never been performed on.
const NEVER: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

impl Coordinator {
    /// Performs `action` at most once per `interval` across every caller
    /// sharing `resource`. Only returns on error.
    pub async fn run_periodically<A: Action>(
        &self,
        resource: &Resource,
        interval: Duration,
        action: A,
    ) -> Result<()> {
        self.run_periodically_until(resource, interval, action, CancellationToken::new())
            .await
    }

    /// Like [`run_periodically`](Self::run_periodically), returning `Ok` once
    /// `cancel` fires between iterations.
    #[tracing::instrument(skip_all, fields(resource = %resource))]
    pub async fn run_periodically_until<A: Action>(
        &self,
        resource: &Resource,
        interval: Duration,
        mut action: A,
        cancel: CancellationToken,
    ) -> Result<()> {
        let period = chrono::Duration::from_std(interval)
            .map_err(|_| Error::InvalidConfig(format!("interval {:?} is out of range", interval)))?;
        next_due(NEVER, period)?;

        while !cancel.is_cancelled() {
            let last_performed = self.run_if_due(resource, period, &mut action).await?;

            let time_left = (next_due(last_performed, period)? - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let delay = time_left.max(self.config.minimum_poll);
            trace!(?delay, "waiting for next check");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!("periodic run cancelled");
        Ok(())
    }

    /// When run-periodically last recorded performing on `resource`.
    pub async fn last_performed(&self, resource: &Resource) -> Result<Option<DateTime<Utc>>> {
        match self.store.get_metadata(resource).await {
            Ok(metadata) => Ok(metadata
                .get(LAST_PERFORMED_KEY)
                .and_then(|value| parse_http_date(value))),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// One iteration: lease, perform if due, release. Yields the best known
    /// time of the last performance, or [`NEVER`] when the lease went elsewhere.
    async fn run_if_due<A: Action>(
        &self,
        resource: &Resource,
        period: chrono::Duration,
        action: &mut A,
    ) -> Result<DateTime<Utc>> {
        let mut lease = self.acquire_lease(resource).await?;
        if !lease.has_lease() {
            trace!("lease held elsewhere");
            return Ok(NEVER);
        }

        let outcome = self.perform_if_due(&lease, period, action).await;
        lease.release().await;
        match outcome {
            Err(err) if err.is_lease_lost() => {
                warn!(%err, "lease lost before last performed time was recorded");
                Ok(NEVER)
            }
            outcome => outcome,
        }
    }

    async fn perform_if_due<A: Action>(
        &self,
        lease: &LeaseHandle,
        period: chrono::Duration,
        action: &mut A,
    ) -> Result<DateTime<Utc>> {
        let mut metadata = lease.metadata().await?;
        let last_performed = metadata
            .get(LAST_PERFORMED_KEY)
            .and_then(|value| parse_http_date(value))
            .unwrap_or(NEVER);

        let now = self.clock.now();
        if now < next_due(last_performed, period)? {
            trace!(%last_performed, "not due yet");
            return Ok(last_performed);
        }

        action.perform().await.map_err(Error::Action)?;
        metadata.insert(LAST_PERFORMED_KEY.to_string(), format_http_date(&now));
        lease.set_metadata(metadata).await?;
        info!(performed_at = %now, "action performed");
        Ok(now)
    }
}

fn next_due(last_performed: DateTime<Utc>, period: chrono::Duration) -> Result<DateTime<Utc>> {
    last_performed.checked_add_signed(period).ok_or_else(|| {
        Error::InvalidConfig(format!(
            "interval {} after {} is past the last representable instant",
            period, last_performed
        ))
    })
}
