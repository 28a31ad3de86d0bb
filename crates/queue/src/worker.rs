//! Worker runtime: polls for work, runs handlers under a live lease.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pressforge_core::WorkerId;

use crate::claim::ClaimEngine;
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::finalize::Finalizer;
use crate::lease::LeaseManager;
use crate::store::{ClaimFilter, JobStore, JobStoreError};
use crate::types::{FinalizeOutcome, HeartbeatOutcome, Job, JobOutcome};

/// What a handler reports back for one job.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Success(JsonValue),
    Failure(String),
}

impl From<HandlerOutcome> for JobOutcome {
    fn from(outcome: HandlerOutcome) -> Self {
        match outcome {
            HandlerOutcome::Success(value) => JobOutcome::Completed(value),
            HandlerOutcome::Failure(error) => JobOutcome::Failed(error),
        }
    }
}

/// Executes one kind of job.
///
/// Handlers own payload decoding; the runtime treats the payload as opaque.
/// A panic-free failure is a `Failure` outcome, which finalizes the job as
/// failed without another retry cycle.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    /// The `job_type` this handler serves.
    fn job_type(&self) -> &str;

    async fn handle(&self, job: &Job) -> HandlerOutcome;
}

/// Routes jobs to handlers by `job_type`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; replaces any previous handler for the same type.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers
            .insert(handler.job_type().to_string(), handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }
}

/// A polling worker.
///
/// Each claimed job runs its handler raced against a heartbeat ticker. As
/// long as the handler runs, the ticker keeps the lease alive; the moment a
/// heartbeat comes back rejected, the handler future is dropped and the job
/// is abandoned to whoever owns it now.
pub struct Worker<S> {
    id: WorkerId,
    claim: ClaimEngine<S>,
    lease: LeaseManager<S>,
    finalizer: Finalizer<S>,
    registry: Arc<HandlerRegistry>,
    filter: ClaimFilter,
    config: QueueConfig,
}

impl<S> Worker<S>
where
    S: JobStore + Clone + 'static,
{
    pub fn new(
        store: S,
        clock: Arc<dyn Clock>,
        registry: Arc<HandlerRegistry>,
        config: QueueConfig,
    ) -> Self {
        Self {
            id: WorkerId::generate(),
            claim: ClaimEngine::new(store.clone(), clock.clone(), config.lease_duration),
            lease: LeaseManager::new(store.clone(), clock.clone(), config.lease_duration),
            finalizer: Finalizer::new(store, clock),
            registry,
            filter: ClaimFilter::any(),
            config,
        }
    }

    pub fn with_id(mut self, id: WorkerId) -> Self {
        self.id = id;
        self
    }

    pub fn with_filter(mut self, filter: ClaimFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Claim one batch and run it to completion. Returns how many jobs were
    /// claimed; zero means the caller should back off before polling again.
    pub async fn poll_once(&self) -> Result<usize, JobStoreError> {
        let batch = self
            .claim
            .claim_pending_jobs(self.config.batch_size, &self.id, &self.filter)
            .await?;
        let count = batch.len();

        for job in batch {
            self.process_job(job).await;
        }

        Ok(count)
    }

    async fn process_job(&self, job: Job) {
        let Some(handler) = self.registry.get(&job.job_type) else {
            warn!(job_id = %job.id, job_type = %job.job_type, "no handler registered, failing job");
            self.finalize(
                &job,
                JobOutcome::Failed(format!("no handler registered for {}", job.job_type)),
            )
            .await;
            return;
        };

        debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts, "running handler");

        let handler_fut = handler.handle(&job);
        tokio::pin!(handler_fut);

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        // The first tick fires immediately; consume it so the loop starts
        // with a full interval ahead of the lease deadline.
        ticker.tick().await;

        loop {
            tokio::select! {
                outcome = &mut handler_fut => {
                    self.finalize(&job, JobOutcome::from(outcome)).await;
                    break;
                }
                _ = ticker.tick() => {
                    match self.lease.update_heartbeat(job.id, &self.id).await {
                        Ok(HeartbeatOutcome::Extended) => {}
                        Ok(HeartbeatOutcome::OwnershipLost) => {
                            // Reclaimed or cancelled under us; drop the
                            // handler and walk away.
                            warn!(job_id = %job.id, worker = %self.id, "lease lost mid-handler, abandoning job");
                            break;
                        }
                        Err(err) => {
                            error!(job_id = %job.id, error = %err, "heartbeat failed, abandoning job");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn finalize(&self, job: &Job, outcome: JobOutcome) {
        match self.finalizer.finalize_job(job.id, &self.id, outcome).await {
            Ok(FinalizeOutcome::Recorded) => {}
            Ok(FinalizeOutcome::OwnershipLost) => {
                debug!(job_id = %job.id, "result discarded, job changed hands");
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "failed to record job outcome");
            }
        }
    }

    /// Sleep between empty polls, with jitter so idle workers spread out.
    fn idle_backoff(&self) -> Duration {
        let jitter = self.config.poll_interval.as_secs_f64()
            * self.config.poll_jitter
            * fastrand::f64();
        self.config.poll_interval + Duration::from_secs_f64(jitter)
    }

    /// Run the poll loop until the returned handle shuts it down.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let join = tokio::spawn(async move {
            info!(worker = %self.id, "worker started");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!(worker = %self.id, "worker shutting down");
                        break;
                    }
                    polled = self.poll_once() => {
                        match polled {
                            Ok(0) => tokio::time::sleep(self.idle_backoff()).await,
                            Ok(_) => {}
                            Err(err) => {
                                error!(worker = %self.id, error = %err, "poll failed, backing off");
                                tokio::time::sleep(self.idle_backoff()).await;
                            }
                        }
                    }
                }
            }
        });

        WorkerHandle {
            shutdown: Some(shutdown_tx),
            join,
        }
    }
}

/// Handle to a running worker task.
pub struct WorkerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for the in-flight batch to wind down.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}
