//! Terminal-state recording for completed work.

use std::sync::Arc;

use tracing::{info, warn};

use pressforge_core::{JobId, WorkerId};

use crate::clock::Clock;
use crate::store::{JobPrecondition, JobStore, JobStoreError, JobUpdate};
use crate::types::{FinalizeOutcome, JobOutcome, JobStatus};

/// Records worker-reported terminal outcomes.
///
/// The guard is ownership alone, not status: a worker that still holds the
/// lock may finalize even if its lease timestamp has lapsed, because the
/// reaper has demonstrably not intervened yet. Once the lock changes hands
/// the stale worker's result is discarded.
#[derive(Clone)]
pub struct Finalizer<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore> Finalizer<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record `outcome` for a job `worker_id` believes it owns.
    pub async fn finalize_job(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        outcome: JobOutcome,
    ) -> Result<FinalizeOutcome, JobStoreError> {
        let now = self.clock.now();
        let status = outcome.status();
        let (result, error) = match outcome {
            JobOutcome::Completed(result) => (Some(result), None),
            JobOutcome::Failed(error) => (None, Some(error)),
        };

        let updated = self
            .store
            .update_if(
                job_id,
                &JobPrecondition::owned_by(worker_id),
                &JobUpdate::finalize(status, now, result, error),
            )
            .await?;

        match updated {
            Some(job) => {
                match status {
                    JobStatus::Completed => {
                        info!(job_id = %job_id, worker = %worker_id, attempts = job.attempts, "job completed")
                    }
                    _ => {
                        warn!(job_id = %job_id, worker = %worker_id, attempts = job.attempts, "job failed")
                    }
                }
                Ok(FinalizeOutcome::Recorded)
            }
            None => {
                warn!(job_id = %job_id, worker = %worker_id, "finalize rejected, lock no longer held");
                Ok(FinalizeOutcome::OwnershipLost)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::ClaimEngine;
    use crate::clock::ManualClock;
    use crate::store::{ClaimFilter, InMemoryJobStore};
    use crate::types::NewJob;
    use pressforge_core::TenantId;
    use serde_json::json;
    use std::time::Duration;

    const LEASE: Duration = Duration::from_secs(60);

    async fn claimed_job(
        store: &Arc<InMemoryJobStore>,
        clock: &ManualClock,
        worker: &WorkerId,
    ) -> crate::types::Job {
        let tenant = TenantId::new();
        let job = NewJob::new(tenant, "wp.sync_post", json!({}), 2).into_job(clock.now());
        store.insert(job).await.unwrap();

        let engine = ClaimEngine::new(store.clone(), Arc::new(clock.clone()), LEASE);
        let mut claimed = engine
            .claim_pending_jobs(1, worker, &ClaimFilter::any())
            .await
            .unwrap();
        claimed.remove(0)
    }

    #[tokio::test]
    async fn finalize_completed_records_result_and_clears_lease() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::default();
        let worker = WorkerId::new("w1");
        let job = claimed_job(&store, &clock, &worker).await;

        let finalizer = Finalizer::new(store.clone(), Arc::new(clock.clone()));
        let outcome = finalizer
            .finalize_job(job.id, &worker, JobOutcome::Completed(json!({"synced": 3})))
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::Recorded);

        let row = store.get(job.tenant_id, job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.result, Some(json!({"synced": 3})));
        assert_eq!(row.processed_at, Some(clock.now()));
        assert!(row.locked_by.is_none());
        assert!(row.lock_expires_at.is_none());
        assert!(row.error.is_none());
    }

    #[tokio::test]
    async fn finalize_failed_records_error() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::default();
        let worker = WorkerId::new("w1");
        let job = claimed_job(&store, &clock, &worker).await;

        let finalizer = Finalizer::new(store.clone(), Arc::new(clock.clone()));
        let outcome = finalizer
            .finalize_job(job.id, &worker, JobOutcome::Failed("upstream 502".into()))
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::Recorded);

        let row = store.get(job.tenant_id, job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.error.as_deref(), Some("upstream 502"));
        assert!(row.result.is_none());
    }

    #[tokio::test]
    async fn finalize_with_lapsed_lease_still_wins_if_lock_held() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::default();
        let worker = WorkerId::new("w1");
        let job = claimed_job(&store, &clock, &worker).await;

        // Lease lapses but the reaper has not run; the lock is still ours.
        clock.advance(chrono::Duration::seconds(120));
        let finalizer = Finalizer::new(store.clone(), Arc::new(clock.clone()));
        let outcome = finalizer
            .finalize_job(job.id, &worker, JobOutcome::Completed(json!(null)))
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::Recorded);
    }

    #[tokio::test]
    async fn finalize_after_reclaim_is_rejected() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::default();
        let worker = WorkerId::new("w1");
        let job = claimed_job(&store, &clock, &worker).await;

        // Lease lapses and the reaper releases the job.
        clock.advance(chrono::Duration::seconds(61));
        store
            .update_if(
                job.id,
                &JobPrecondition::stuck(&worker, clock.now()),
                &JobUpdate::release_for_retry(),
            )
            .await
            .unwrap()
            .expect("reclaim should win");

        let finalizer = Finalizer::new(store.clone(), Arc::new(clock.clone()));
        let outcome = finalizer
            .finalize_job(job.id, &worker, JobOutcome::Completed(json!("late")))
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::OwnershipLost);

        // The stale result left no trace.
        let row = store.get(job.tenant_id, job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert!(row.result.is_none());
        assert!(row.processed_at.is_none());
    }

    #[tokio::test]
    async fn finalize_after_rival_claims_is_rejected() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::default();
        let worker = WorkerId::new("w1");
        let job = claimed_job(&store, &clock, &worker).await;

        // Reclaim, then a second worker claims the same job.
        clock.advance(chrono::Duration::seconds(61));
        store
            .update_if(
                job.id,
                &JobPrecondition::stuck(&worker, clock.now()),
                &JobUpdate::release_for_retry(),
            )
            .await
            .unwrap()
            .unwrap();
        let rival = WorkerId::new("w2");
        let engine = ClaimEngine::new(store.clone(), Arc::new(clock.clone()), LEASE);
        let reclaimed = engine
            .claim_pending_jobs(1, &rival, &ClaimFilter::any())
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);

        let finalizer = Finalizer::new(store.clone(), Arc::new(clock.clone()));
        let outcome = finalizer
            .finalize_job(job.id, &worker, JobOutcome::Completed(json!("stale")))
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::OwnershipLost);

        // The rival's claim is intact.
        let row = store.get(job.tenant_id, job.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Processing);
        assert_eq!(row.locked_by, Some(rival));
    }
}
