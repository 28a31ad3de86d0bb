//! Lease extension for in-flight jobs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use pressforge_core::{JobId, WorkerId};

use crate::clock::Clock;
use crate::store::{JobPrecondition, JobStore, JobStoreError, JobUpdate};
use crate::types::HeartbeatOutcome;

/// Extends leases on behalf of job owners.
///
/// A heartbeat only succeeds while the row is still processing under the
/// same worker. If the reaper reclaimed the job in the meantime, the guard
/// fails and the caller learns it no longer owns the job; that is a signal
/// to abandon the work, not an error.
#[derive(Clone)]
pub struct LeaseManager<S> {
    store: S,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
}

impl<S: JobStore> LeaseManager<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, lease_duration: Duration) -> Self {
        Self {
            store,
            clock,
            lease_duration,
        }
    }

    /// Push the lease out another full `lease_duration` from now.
    pub async fn update_heartbeat(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
    ) -> Result<HeartbeatOutcome, JobStoreError> {
        let now = self.clock.now();
        let lease_until =
            now + chrono::Duration::from_std(self.lease_duration).unwrap_or_default();

        let updated = self
            .store
            .update_if(
                job_id,
                &JobPrecondition::processing_owned_by(worker_id),
                &JobUpdate::heartbeat(now, lease_until),
            )
            .await?;

        match updated {
            Some(_) => {
                debug!(job_id = %job_id, worker = %worker_id, lease_until = %lease_until, "heartbeat extended lease");
                Ok(HeartbeatOutcome::Extended)
            }
            None => {
                warn!(job_id = %job_id, worker = %worker_id, "heartbeat rejected, lease no longer held");
                Ok(HeartbeatOutcome::OwnershipLost)
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

    const LEASE: Duration = Duration::from_secs(60);

    async fn claimed_job(
        store: &Arc<InMemoryJobStore>,
        clock: &ManualClock,
        worker: &WorkerId,
    ) -> crate::types::Job {
        let tenant = TenantId::new();
        let job = NewJob::new(tenant, "wp.sync_post", json!({}), 3).into_job(clock.now());
        store.insert(job).await.unwrap();

        let engine = ClaimEngine::new(store.clone(), Arc::new(clock.clone()), LEASE);
        let mut claimed = engine
            .claim_pending_jobs(1, worker, &ClaimFilter::any())
            .await
            .unwrap();
        claimed.remove(0)
    }

    #[tokio::test]
    async fn heartbeat_extends_lease_from_now() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::default();
        let worker = WorkerId::new("w1");
        let job = claimed_job(&store, &clock, &worker).await;

        clock.advance(chrono::Duration::seconds(40));
        let manager = LeaseManager::new(store.clone(), Arc::new(clock.clone()), LEASE);
        let outcome = manager.update_heartbeat(job.id, &worker).await.unwrap();
        assert_eq!(outcome, HeartbeatOutcome::Extended);

        let row = store.get(job.tenant_id, job.id).await.unwrap().unwrap();
        assert_eq!(
            row.lock_expires_at,
            Some(clock.now() + chrono::Duration::seconds(60))
        );
        assert_eq!(row.last_heartbeat_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn heartbeat_from_non_owner_is_rejected() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::default();
        let worker = WorkerId::new("w1");
        let job = claimed_job(&store, &clock, &worker).await;

        let manager = LeaseManager::new(store.clone(), Arc::new(clock.clone()), LEASE);
        let outcome = manager
            .update_heartbeat(job.id, &WorkerId::new("w2"))
            .await
            .unwrap();
        assert_eq!(outcome, HeartbeatOutcome::OwnershipLost);

        // The real owner's lease is untouched.
        let row = store.get(job.tenant_id, job.id).await.unwrap().unwrap();
        assert_eq!(row.locked_by, Some(worker));
        assert_eq!(row.lock_expires_at, job.lock_expires_at);
    }

    #[tokio::test]
    async fn heartbeat_after_reclaim_reports_ownership_lost() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::default();
        let worker = WorkerId::new("w1");
        let job = claimed_job(&store, &clock, &worker).await;

        // Simulate the reaper releasing the job back to pending.
        clock.advance(chrono::Duration::seconds(61));
        store
            .update_if(
                job.id,
                &JobPrecondition::stuck(&worker, clock.now()),
                &JobUpdate::release_for_retry(),
            )
            .await
            .unwrap()
            .expect("lease lapsed, reclaim should win");

        let manager = LeaseManager::new(store.clone(), Arc::new(clock.clone()), LEASE);
        let outcome = manager.update_heartbeat(job.id, &worker).await.unwrap();
        assert_eq!(outcome, HeartbeatOutcome::OwnershipLost);
    }

    #[tokio::test]
    async fn heartbeat_on_missing_job_is_not_found() {
        let store = InMemoryJobStore::arc();
        let manager = LeaseManager::new(store, Arc::new(ManualClock::default()), LEASE);
        let result = manager
            .update_heartbeat(JobId::new(), &WorkerId::new("w1"))
            .await;
        assert!(matches!(result, Err(JobStoreError::NotFound(_))));
    }
}
