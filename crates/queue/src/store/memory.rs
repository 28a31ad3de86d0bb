//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use pressforge_core::{JobId, TenantId};

use super::{ClaimFilter, JobPrecondition, JobStore, JobStoreError, JobUpdate};
use crate::types::{Job, JobStatus, QueueStats};

/// In-memory job store.
///
/// A single write lock makes `update_if` trivially atomic: the precondition
/// check and the mutation happen under one guard, which is the same
/// indivisibility the Postgres implementation gets from a guarded UPDATE.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        match jobs.get(&job_id) {
            Some(job) if job.tenant_id == tenant_id => Ok(Some(job.clone())),
            Some(_) => Err(JobStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    async fn select_pending(
        &self,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut candidates: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && filter.accepts(j))
            .cloned()
            .collect();

        // Oldest first for rough FIFO fairness
        candidates.sort_by_key(|j| j.created_at);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn select_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut stuck: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing && j.lease_expired(now))
            .cloned()
            .collect();

        stuck.sort_by_key(|j| j.lock_expires_at);
        stuck.truncate(limit);
        Ok(stuck)
    }

    async fn update_if(
        &self,
        job_id: JobId,
        precondition: &JobPrecondition,
        update: &JobUpdate,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Err(JobStoreError::NotFound(job_id));
        };

        if !precondition.matches(job) {
            return Ok(None);
        }

        update.apply(job, Utc::now());
        Ok(Some(job.clone()))
    }

    async fn list_by_status(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut stats = QueueStats::default();

        for job in jobs.values() {
            if job.tenant_id != tenant_id {
                continue;
            }
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }

        Ok(stats)
    }
}
