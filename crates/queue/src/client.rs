//! Producer and admin surface of the queue.

use std::sync::Arc;

use tracing::{info, warn};

use pressforge_core::{DomainError, JobId, TenantId};

use crate::clock::Clock;
use crate::store::{JobPrecondition, JobStore, JobStoreError, JobUpdate};
use crate::types::{CancelOutcome, Job, JobStatus, NewJob, QueueStats};

/// Client-facing queue error: either the request was invalid, or the store
/// failed underneath it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Enqueues work and answers admin queries.
///
/// All reads are tenant scoped; the client never exposes another tenant's
/// jobs regardless of the id presented.
#[derive(Clone)]
pub struct QueueClient<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore> QueueClient<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Validate and enqueue a job. A rejected request creates no row.
    pub async fn enqueue(&self, request: NewJob) -> Result<JobId, QueueError> {
        request.validate()?;
        let job = request.into_job(self.clock.now());
        let id = self.store.insert(job).await?;
        info!(job_id = %id, "job enqueued");
        Ok(id)
    }

    /// Withdraw a job from circulation.
    ///
    /// Pending jobs are cancelled outright. Processing jobs are cancelled
    /// with the lock cleared, so the owner's next heartbeat comes back as
    /// `OwnershipLost` and it abandons the handler. Terminal jobs are left
    /// as they are.
    pub async fn cancel(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<CancelOutcome, QueueError> {
        // Tenant check up front; cancel never crosses tenants.
        let Some(job) = self.store.get(tenant_id, job_id).await? else {
            return Err(JobStoreError::NotFound(job_id).into());
        };

        for status in [JobStatus::Pending, JobStatus::Processing] {
            let precondition = JobPrecondition {
                status: Some(status),
                ..JobPrecondition::default()
            };
            let cancelled = self
                .store
                .update_if(job_id, &precondition, &JobUpdate::cancel())
                .await?;
            if cancelled.is_some() {
                info!(job_id = %job_id, was = %status, "job cancelled");
                return Ok(CancelOutcome::Cancelled);
            }
        }

        // Neither guard matched: the job reached a terminal state first
        // (or was already cancelled). Report what we last saw.
        let current = self
            .store
            .get(tenant_id, job_id)
            .await?
            .map(|j| j.status)
            .unwrap_or(job.status);
        warn!(job_id = %job_id, status = %current, "cancel skipped, job already finished");
        Ok(CancelOutcome::AlreadyFinished(current))
    }

    pub async fn get(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
    ) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get(tenant_id, job_id).await?)
    }

    pub async fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list_by_status(tenant_id, status, limit).await?)
    }

    pub async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, QueueError> {
        Ok(self.store.stats(tenant_id).await?)
    }
}
