//! Claim engine: atomically moves pending jobs under a worker's lease.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use pressforge_core::WorkerId;

use crate::clock::Clock;
use crate::store::{ClaimFilter, JobPrecondition, JobStore, JobStoreError, JobUpdate};
use crate::types::Job;

/// Claims batches of pending jobs for one worker.
///
/// Selection and claiming are two steps: a snapshot read picks candidates
/// oldest-first, then each candidate is taken with a single conditional
/// update guarded on "still pending". A candidate claimed by someone else
/// between the two steps simply fails the guard and is skipped; the caller
/// receives fewer jobs than requested, never an error.
#[derive(Clone)]
pub struct ClaimEngine<S> {
    store: S,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
}

impl<S: JobStore> ClaimEngine<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, lease_duration: Duration) -> Self {
        Self {
            store,
            clock,
            lease_duration,
        }
    }

    /// Claim up to `batch_size` pending jobs matching `filter`.
    ///
    /// Returns only jobs now owned by `worker_id`; an empty result means
    /// nothing was available. Never blocks waiting for work. Every
    /// successful claim increments `attempts`, including the first.
    pub async fn claim_pending_jobs(
        &self,
        batch_size: usize,
        worker_id: &WorkerId,
        filter: &ClaimFilter,
    ) -> Result<Vec<Job>, JobStoreError> {
        let candidates = self.store.select_pending(filter, batch_size).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let lease_until =
            now + chrono::Duration::from_std(self.lease_duration).unwrap_or_default();

        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let won = self
                .store
                .update_if(
                    candidate.id,
                    &JobPrecondition::still_pending(),
                    &JobUpdate::claim(worker_id, now, lease_until),
                )
                .await?;

            match won {
                Some(job) => {
                    debug!(job_id = %job.id, job_type = %job.job_type, worker = %worker_id, attempts = job.attempts, "claimed job");
                    claimed.push(job);
                }
                // Lost the race to a concurrent worker; skip silently.
                None => {
                    debug!(job_id = %candidate.id, worker = %worker_id, "claim lost race, skipping");
                }
            }
        }

        Ok(claimed)
    }
}
