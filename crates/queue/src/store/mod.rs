//! Job storage abstraction.
//!
//! The store is the only shared mutable state in the dispatch layer. Its one
//! correctness-bearing operation is [`JobStore::update_if`]: apply a set of
//! field changes to a row, but only if the row still matches an expected
//! prior state at the moment of the update. Every state transition in the
//! engine (claim, heartbeat, finalize, reclaim, cancel) is exactly one
//! `update_if` call; application code never does read-then-write without the
//! store re-checking the predicate atomically.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use pressforge_core::{JobId, TenantId, WorkerId};

use crate::types::{Job, JobStatus, QueueStats};

mod memory;
mod postgres;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Job store error.
///
/// `Storage` is the only truly exceptional condition (store I/O); callers
/// retry with backoff at the call site. Lease and ownership races are *not*
/// errors; they surface as a `None` from `update_if`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Candidate filter for claim scans.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    /// Restrict to one tenant (shared workers pass `None`)
    pub tenant_id: Option<TenantId>,
    /// Restrict to one job type
    pub job_type: Option<String>,
}

impl ClaimFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Self::default()
        }
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn accepts(&self, job: &Job) -> bool {
        if let Some(tenant) = self.tenant_id {
            if job.tenant_id != tenant {
                return false;
            }
        }
        if let Some(ref job_type) = self.job_type {
            if &job.job_type != job_type {
                return false;
            }
        }
        true
    }
}

/// Expected prior state, re-asserted atomically inside `update_if`.
///
/// `None` fields are unchecked. `locked_by` is tri-state: unchecked, must be
/// unowned (`Some(None)`), or must be held by an exact worker.
#[derive(Debug, Clone, Default)]
pub struct JobPrecondition {
    pub status: Option<JobStatus>,
    pub locked_by: Option<Option<WorkerId>>,
    /// Row's `lock_expires_at` must be set and strictly before this instant
    pub lock_expired_before: Option<DateTime<Utc>>,
}

impl JobPrecondition {
    /// Claim guard: the row is still pending (and therefore unowned).
    pub fn still_pending() -> Self {
        Self {
            status: Some(JobStatus::Pending),
            locked_by: Some(None),
            lock_expired_before: None,
        }
    }

    /// Heartbeat guard: still processing under this exact owner.
    pub fn processing_owned_by(worker: &WorkerId) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            locked_by: Some(Some(worker.clone())),
            lock_expired_before: None,
        }
    }

    /// Finalize guard: ownership only, per the finalizer contract.
    pub fn owned_by(worker: &WorkerId) -> Self {
        Self {
            status: None,
            locked_by: Some(Some(worker.clone())),
            lock_expired_before: None,
        }
    }

    /// Reaper guard: still stuck exactly as observed; processing, same
    /// owner, lease still lapsed.
    pub fn stuck(owner: &WorkerId, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            locked_by: Some(Some(owner.clone())),
            lock_expired_before: Some(now),
        }
    }

    /// Evaluate the predicate against a row snapshot.
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(ref expected_owner) = self.locked_by {
            if &job.locked_by != expected_owner {
                return false;
            }
        }
        if let Some(deadline) = self.lock_expired_before {
            match job.lock_expires_at {
                Some(expires) if expires < deadline => {}
                _ => return false,
            }
        }
        true
    }
}

/// Field changes applied by `update_if`.
///
/// Nested options distinguish "leave unchanged" (outer `None`) from "set to
/// NULL" (`Some(None)`). Constructors below are the only transitions the
/// engine performs.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub locked_by: Option<Option<WorkerId>>,
    pub locked_at: Option<Option<DateTime<Utc>>>,
    pub lock_expires_at: Option<Option<DateTime<Utc>>>,
    pub last_heartbeat_at: Option<Option<DateTime<Utc>>>,
    pub increment_attempts: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

impl JobUpdate {
    /// Pending → processing under `worker`, lease open until `now + lease`.
    pub fn claim(worker: &WorkerId, now: DateTime<Utc>, lease_until: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            locked_by: Some(Some(worker.clone())),
            locked_at: Some(Some(now)),
            lock_expires_at: Some(Some(lease_until)),
            last_heartbeat_at: Some(Some(now)),
            increment_attempts: true,
            ..Self::default()
        }
    }

    /// Extend the lease without any state change.
    pub fn heartbeat(now: DateTime<Utc>, lease_until: DateTime<Utc>) -> Self {
        Self {
            last_heartbeat_at: Some(Some(now)),
            lock_expires_at: Some(Some(lease_until)),
            ..Self::default()
        }
    }

    /// Reaper retry path: back to pending, all lease fields cleared.
    pub fn release_for_retry() -> Self {
        Self {
            status: Some(JobStatus::Pending),
            locked_by: Some(None),
            locked_at: Some(None),
            lock_expires_at: Some(None),
            last_heartbeat_at: Some(None),
            ..Self::default()
        }
    }

    /// Reaper exhausted path: terminal failure, lease cleared.
    pub fn exhausted(now: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            locked_by: Some(None),
            locked_at: Some(None),
            lock_expires_at: Some(None),
            last_heartbeat_at: Some(None),
            processed_at: Some(now),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Worker-reported terminal outcome, lease cleared.
    pub fn finalize(
        status: JobStatus,
        now: DateTime<Utc>,
        result: Option<JsonValue>,
        error: Option<String>,
    ) -> Self {
        Self {
            status: Some(status),
            locked_by: Some(None),
            locked_at: Some(None),
            lock_expires_at: Some(None),
            last_heartbeat_at: Some(None),
            processed_at: Some(now),
            result,
            error,
            ..Self::default()
        }
    }

    /// Administrative cancellation; clears the lease so a stale owner cannot
    /// finalize over it (`processed_at` stays unset, reserved for the
    /// finalizer and reaper).
    pub fn cancel() -> Self {
        Self {
            status: Some(JobStatus::Cancelled),
            locked_by: Some(None),
            locked_at: Some(None),
            lock_expires_at: Some(None),
            last_heartbeat_at: Some(None),
            ..Self::default()
        }
    }

    /// Apply the changes to a row snapshot.
    pub fn apply(&self, job: &mut Job, updated_at: DateTime<Utc>) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(ref locked_by) = self.locked_by {
            job.locked_by = locked_by.clone();
        }
        if let Some(locked_at) = self.locked_at {
            job.locked_at = locked_at;
        }
        if let Some(lock_expires_at) = self.lock_expires_at {
            job.lock_expires_at = lock_expires_at;
        }
        if let Some(last_heartbeat_at) = self.last_heartbeat_at {
            job.last_heartbeat_at = last_heartbeat_at;
        }
        if self.increment_attempts {
            job.attempts += 1;
        }
        if let Some(processed_at) = self.processed_at {
            job.processed_at = Some(processed_at);
        }
        if let Some(ref result) = self.result {
            job.result = Some(result.clone());
        }
        if let Some(ref error) = self.error {
            job.error = Some(error.clone());
        }
        job.updated_at = updated_at;
    }
}

/// Durable, queryable job storage.
///
/// Implementations must make `update_if` atomic with respect to concurrent
/// callers: the precondition check and the field changes happen as one
/// indivisible operation (a guarded UPDATE in SQL, a single critical section
/// in memory).
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Create a new row. Fails with `AlreadyExists` on id collision.
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Tenant-scoped read. Accessing another tenant's job is an isolation
    /// violation, not a miss.
    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Pending candidates, oldest first.
    async fn select_pending(
        &self,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Processing rows whose lease lapsed before `now`.
    async fn select_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// The conditional-update primitive. Returns the updated row when the
    /// precondition held, `None` when it no longer matched (benign race).
    async fn update_if(
        &self,
        job_id: JobId,
        precondition: &JobPrecondition,
        update: &JobUpdate,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Tenant-scoped listing, oldest first.
    async fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Per-tenant status counts.
    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, JobStoreError>;
}

#[async_trait::async_trait]
impl<S> JobStore for std::sync::Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(tenant_id, job_id).await
    }

    async fn select_pending(
        &self,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).select_pending(filter, limit).await
    }

    async fn select_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).select_expired(now, limit).await
    }

    async fn update_if(
        &self,
        job_id: JobId,
        precondition: &JobPrecondition,
        update: &JobUpdate,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).update_if(job_id, precondition, update).await
    }

    async fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(tenant_id, status, limit).await
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, JobStoreError> {
        (**self).stats(tenant_id).await
    }
}
