//! Operator surface: lag per view and failed-event recovery.

use crate::engine::{ProjectionBackend, ProjectionEngine};
use crate::errors::{ProjectionError, ProjectionResult};
use chrono::{DateTime, Utc};
use iamstore_types::{
    CurrentSequence, FailedEvent, ProjectionName, Sequence,
    TenantId,
};
use serde::Serialize;
use tracing::{info, instrument};

/// How far one projection trails the log for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewState {
    /// Projection name.
    pub projection: ProjectionName,
    /// Tenant.
    pub tenant: TenantId,
    /// Last processed sequence.
    pub current: Sequence,
    /// Latest sequence the projection would consume.
    pub latest: Sequence,
    /// When the projection last advanced, if ever.
    pub last_successful_run: Option<DateTime<Utc>>,
    /// Ledger entries still being retried.
    pub retrying_events: usize,
    /// Ledger entries at the failure cap.
    pub parked_events: usize,
}

impl ViewState {
    /// Number of matching sequences not yet processed.
    pub fn lag(&self) -> u64 {
        self.latest
            .into_inner()
            .saturating_sub(self.current.into_inner())
    }
}

impl<S: ProjectionBackend> ProjectionEngine<S> {
    /// Positions of every projection, optionally restricted to one.
    pub async fn current_sequences(
        &self,
        projection: Option<&ProjectionName>,
    ) -> ProjectionResult<Vec<CurrentSequence>> {
        Ok(self.store().current_sequences(projection).await?)
    }

    /// Lag and ledger state of every registered projection for one tenant.
    #[instrument(name = "projection.view_states", skip(self))]
    pub async fn view_states(&self, tenant: &TenantId) -> ProjectionResult<Vec<ViewState>> {
        let store = self.store();
        let positions = store.current_sequences(None).await?;
        let failed = store.failed_events(None, Some(tenant)).await?;
        let max_failure_count = self.config().max_failure_count;

        let mut states = Vec::new();
        for projection in self.views() {
            let handler = self.handler(&projection)?;
            let latest = store.latest_sequence(&handler.selection(tenant)).await?;
            let position = positions
                .iter()
                .find(|position| position.projection == projection && &position.tenant == tenant);
            let (parked, retrying): (Vec<&FailedEvent>, Vec<&FailedEvent>) = failed
                .iter()
                .filter(|entry| entry.projection == projection)
                .partition(|entry| entry.failure_count >= max_failure_count);

            states.push(ViewState {
                current: position.map_or_else(Sequence::zero, |position| position.sequence),
                last_successful_run: position.map(|position| position.last_successful_run),
                latest,
                retrying_events: retrying.len(),
                parked_events: parked.len(),
                projection,
                tenant: tenant.clone(),
            });
        }
        Ok(states)
    }

    /// Ledger entries, optionally restricted to one projection and/or tenant.
    pub async fn failed_events(
        &self,
        projection: Option<&ProjectionName>,
        tenant: Option<&TenantId>,
    ) -> ProjectionResult<Vec<FailedEvent>> {
        Ok(self.store().failed_events(projection, tenant).await?)
    }

    /// Forgets a failure. The event is not processed again.
    #[instrument(name = "projection.remove_failed_event", skip(self))]
    pub async fn remove_failed_event(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        sequence: Sequence,
    ) -> ProjectionResult<()> {
        if !self
            .store()
            .remove_failed_event(projection, tenant, sequence)
            .await?
        {
            return Err(unknown_failed_event(projection, tenant, sequence));
        }
        info!(
            projection = %projection,
            tenant = %tenant,
            sequence = %sequence,
            "[projection.remove_failed_event] failed event removed"
        );
        Ok(())
    }

    /// Resets a failure's count so the next catch-up retries it, parked or not.
    #[instrument(name = "projection.retry_failed_event", skip(self))]
    pub async fn retry_failed_event(
        &self,
        projection: &ProjectionName,
        tenant: &TenantId,
        sequence: Sequence,
    ) -> ProjectionResult<()> {
        if !self
            .store()
            .reset_failure_count(projection, tenant, sequence)
            .await?
        {
            return Err(unknown_failed_event(projection, tenant, sequence));
        }
        info!(
            projection = %projection,
            tenant = %tenant,
            sequence = %sequence,
            "[projection.retry_failed_event] failed event scheduled for retry"
        );
        Ok(())
    }

    /// Drops a projection's rows, positions and ledger entries; the next
    /// catch-up rebuilds it from the first event.
    #[instrument(name = "projection.reset", skip(self))]
    pub async fn reset_projection(&self, projection: &ProjectionName) -> ProjectionResult<()> {
        let _ = self.handler(projection)?;
        self.store().reset(projection).await?;
        info!(projection = %projection, "[projection.reset] projection dropped for rebuild");
        Ok(())
    }
}

fn unknown_failed_event(
    projection: &ProjectionName,
    tenant: &TenantId,
    sequence: Sequence,
) -> ProjectionError {
    ProjectionError::UnknownFailedEvent {
        projection: projection.clone(),
        tenant: tenant.clone(),
        sequence,
    }
}
