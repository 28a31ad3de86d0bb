//! Lease reaper: recovers jobs abandoned by crashed or partitioned workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::store::{JobPrecondition, JobStore, JobStoreError, JobUpdate};
use crate::types::RecoveryReport;

/// Upper bound on expired rows examined per pass. A backlog larger than this
/// drains across successive passes.
const REAP_BATCH: usize = 256;

/// Scans for lapsed leases and puts the work back into circulation.
///
/// Each recovery is one conditional update guarded on the exact stuck state
/// observed (processing, same owner, lease still lapsed). Two reapers racing
/// over the same backlog split the rows between them; no job is recovered
/// twice and no live lease is ever touched.
#[derive(Clone)]
pub struct Reaper<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S> Reaper<S>
where
    S: JobStore + Clone + 'static,
{
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// One recovery pass over currently expired leases.
    ///
    /// Jobs with retries remaining go back to `pending`; jobs that already
    /// burned `max_attempts` move to `failed` with an abandonment error.
    pub async fn recover_stuck_jobs(&self) -> Result<RecoveryReport, JobStoreError> {
        let now = self.clock.now();
        let stuck = self.store.select_expired(now, REAP_BATCH).await?;

        let mut report = RecoveryReport::default();
        for job in stuck {
            // A processing row always has an owner; a row that lost it
            // between the scan and here just fails the guard below.
            let Some(owner) = job.locked_by.clone() else {
                continue;
            };

            let update = if job.retries_remaining() {
                JobUpdate::release_for_retry()
            } else {
                JobUpdate::exhausted(
                    now,
                    format!(
                        "lease expired after attempt {} of {}; worker presumed dead",
                        job.attempts, job.max_attempts
                    ),
                )
            };

            let reclaimed = self
                .store
                .update_if(job.id, &JobPrecondition::stuck(&owner, now), &update)
                .await?;

            match reclaimed {
                Some(recovered) if job.retries_remaining() => {
                    info!(job_id = %recovered.id, attempts = recovered.attempts, max_attempts = recovered.max_attempts, abandoned_by = %owner, "recovered abandoned job for retry");
                    report.recovered += 1;
                }
                Some(recovered) => {
                    warn!(job_id = %recovered.id, attempts = recovered.attempts, abandoned_by = %owner, "abandoned job exhausted attempts, marking failed");
                    report.moved_to_failed += 1;
                }
                // Heartbeat, finalize or a rival reaper got there first.
                None => {
                    debug!(job_id = %job.id, "stuck job changed state before recovery, skipping");
                }
            }
        }

        Ok(report)
    }

    /// Run recovery passes forever on `interval`, until the returned handle
    /// shuts it down.
    pub fn spawn(self, interval: Duration) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.recover_stuck_jobs().await {
                            Ok(report) if report.recovered + report.moved_to_failed > 0 => {
                                info!(recovered = report.recovered, moved_to_failed = report.moved_to_failed, "reaper pass finished");
                            }
                            Ok(_) => {}
                            Err(err) => {
                                // Transient store trouble; the next tick retries.
                                error!(error = %err, "reaper pass failed");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("reaper shutting down");
                        break;
                    }
                }
            }
        });

        ReaperHandle {
            shutdown: Some(shutdown_tx),
            join,
        }
    }
}

/// Handle to a running reaper task.
pub struct ReaperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signal shutdown and wait for the current pass to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::ClaimEngine;
    use crate::clock::ManualClock;
    use crate::store::{ClaimFilter, InMemoryJobStore};
    use crate::types::{JobStatus, NewJob};
    use pressforge_core::{TenantId, WorkerId};
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(60);

    fn claim_engine(
        store: Arc<InMemoryJobStore>,
        clock: ManualClock,
    ) -> ClaimEngine<Arc<InMemoryJobStore>> {
        ClaimEngine::new(store, Arc::new(clock), LEASE)
    }

    async fn enqueue(
        store: &InMemoryJobStore,
        clock: &ManualClock,
        max_attempts: u32,
    ) -> (TenantId, pressforge_core::JobId) {
        let tenant = TenantId::new();
        let job = NewJob::new(tenant, "wp.sync_post", json!({}), max_attempts)
            .into_job(clock.now());
        let id = store.insert(job).await.unwrap();
        (tenant, id)
    }

    #[tokio::test]
    async fn expired_lease_with_retries_goes_back_to_pending() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::default();
        let (tenant, id) = enqueue(&store, &clock, 3).await;

        claim_engine(store.clone(), clock.clone())
            .claim_pending_jobs(1, &WorkerId::new("w1"), &ClaimFilter::any())
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(61));
        let reaper = Reaper::new(store.clone(), Arc::new(clock.clone()) as Arc<dyn Clock>);
        let report = reaper.recover_stuck_jobs().await.unwrap();
        assert_eq!(report, RecoveryReport { recovered: 1, moved_to_failed: 0 });

        let row = store.get(tenant, id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert!(row.locked_by.is_none());
        assert!(row.lock_expires_at.is_none());
        // The burned attempt stays on the record.
        assert_eq!(row.attempts, 1);
    }

    #[tokio::test]
    async fn expired_lease_with_attempts_exhausted_fails_terminally() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::default();
        let (tenant, id) = enqueue(&store, &clock, 1).await;

        claim_engine(store.clone(), clock.clone())
            .claim_pending_jobs(1, &WorkerId::new("w1"), &ClaimFilter::any())
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(61));
        let reaper = Reaper::new(store.clone(), Arc::new(clock.clone()) as Arc<dyn Clock>);
        let report = reaper.recover_stuck_jobs().await.unwrap();
        assert_eq!(report, RecoveryReport { recovered: 0, moved_to_failed: 1 });

        let row = store.get(tenant, id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert!(row.error.as_deref().unwrap().contains("lease expired"));
        assert_eq!(row.processed_at, Some(clock.now()));
        assert!(row.locked_by.is_none());
    }

    #[tokio::test]
    async fn live_leases_are_left_alone() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::default();
        let (tenant, id) = enqueue(&store, &clock, 3).await;

        claim_engine(store.clone(), clock.clone())
            .claim_pending_jobs(1, &WorkerId::new("w1"), &ClaimFilter::any())
            .await
            .unwrap();

        // Lease still has 30 seconds left.
        clock.advance(chrono::Duration::seconds(30));
        let reaper = Reaper::new(store.clone(), Arc::new(clock.clone()) as Arc<dyn Clock>);
        let report = reaper.recover_stuck_jobs().await.unwrap();
        assert_eq!(report, RecoveryReport::default());

        let row = store.get(tenant, id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn two_expirations_exhaust_a_two_attempt_job() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::default();
        let (tenant, id) = enqueue(&store, &clock, 2).await;
        let reaper = Reaper::new(store.clone(), Arc::new(clock.clone()) as Arc<dyn Clock>);

        // First claim expires; job is recovered with one retry left.
        claim_engine(store.clone(), clock.clone())
            .claim_pending_jobs(1, &WorkerId::new("w1"), &ClaimFilter::any())
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(61));
        let first = reaper.recover_stuck_jobs().await.unwrap();
        assert_eq!(first.recovered, 1);

        // Second claim expires too; attempts are now exhausted.
        claim_engine(store.clone(), clock.clone())
            .claim_pending_jobs(1, &WorkerId::new("w2"), &ClaimFilter::any())
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(61));
        let second = reaper.recover_stuck_jobs().await.unwrap();
        assert_eq!(second.moved_to_failed, 1);

        let row = store.get(tenant, id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.attempts, 2);
    }

    #[tokio::test]
    async fn rival_reapers_split_the_backlog() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::default();
        for _ in 0..5 {
            enqueue(&store, &clock, 3).await;
        }

        claim_engine(store.clone(), clock.clone())
            .claim_pending_jobs(5, &WorkerId::new("w1"), &ClaimFilter::any())
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(61));

        let a = Reaper::new(store.clone(), Arc::new(clock.clone()) as Arc<dyn Clock>);
        let b = Reaper::new(store.clone(), Arc::new(clock.clone()) as Arc<dyn Clock>);
        let (ra, rb) = tokio::join!(a.recover_stuck_jobs(), b.recover_stuck_jobs());
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        // Each job is recovered exactly once across both passes.
        assert_eq!(ra.recovered + rb.recovered, 5);
        assert_eq!(ra.moved_to_failed + rb.moved_to_failed, 0);
    }

    #[tokio::test]
    async fn spawned_reaper_recovers_and_shuts_down() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::default();
        let (tenant, id) = enqueue(&store, &clock, 3).await;

        claim_engine(store.clone(), clock.clone())
            .claim_pending_jobs(1, &WorkerId::new("w1"), &ClaimFilter::any())
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(61));

        let reaper = Reaper::new(store.clone(), Arc::new(clock.clone()) as Arc<dyn Clock>);
        let handle = reaper.spawn(Duration::from_millis(10));

        // Wait for at least one pass.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        let row = store.get(tenant, id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Pending);
    }
}
