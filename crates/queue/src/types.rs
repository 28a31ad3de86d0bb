//! Core job types for the dispatch engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use pressforge_core::{DomainError, DomainResult, JobId, TenantId, WorkerId};

/// Job execution status.
///
/// Stored as snake_case text; `as_str`/`FromStr` round-trip through SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, eligible for claiming
    Pending,
    /// Claimed by a worker holding a live lease
    Processing,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully (handler failure or attempts exhausted)
    Failed,
    /// Withdrawn by an administrative action; never claimed again
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable unit of dispatched work.
///
/// `id`, `tenant_id`, `job_type`, `payload` and `max_attempts` are immutable
/// after creation; everything else is driven by the engine through conditional
/// updates on the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Tenant scope (multi-tenant platform boundary)
    pub tenant_id: TenantId,
    /// Routes to a registered handler
    pub job_type: String,
    /// Opaque handler data, decoded only inside the handler
    pub payload: JsonValue,
    pub status: JobStatus,
    /// Claim cycles started; incremented on every successful claim
    pub attempts: u32,
    /// Ceiling on `attempts`, set at creation
    pub max_attempts: u32,
    /// Worker currently holding the lease, if any
    pub locked_by: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Lease deadline; past this the job counts as abandoned
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set exactly once, at terminal resolution
    pub processed_at: Option<DateTime<Utc>>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

impl Job {
    /// True when the lease has lapsed relative to `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lock_expires_at, Some(deadline) if deadline < now)
    }

    /// True when the job may still be retried after abandonment.
    pub fn retries_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// A validated enqueue request.
///
/// Validation happens before any row is created; a rejected request leaves no
/// trace in the store.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub job_type: String,
    pub payload: JsonValue,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(
        tenant_id: TenantId,
        job_type: impl Into<String>,
        payload: JsonValue,
        max_attempts: u32,
    ) -> Self {
        Self {
            tenant_id,
            job_type: job_type.into(),
            payload,
            max_attempts,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(DomainError::validation("job_type must not be empty"));
        }
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be >= 1"));
        }
        Ok(())
    }

    /// Materialize the pending row this request creates.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            tenant_id: self.tenant_id,
            job_type: self.job_type,
            payload: self.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            locked_by: None,
            locked_at: None,
            lock_expires_at: None,
            last_heartbeat_at: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
            result: None,
            error: None,
        }
    }
}

/// Terminal outcome a worker reports for a job it owns.
///
/// Restricting finalization to these two variants keeps `Cancelled` out of
/// reach of workers; cancellation is an administrative transition.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(JsonValue),
    /// Deliberate, non-retryable handler failure
    Failed(String),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed(_) => JobStatus::Completed,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }
}

/// Result of a heartbeat call.
///
/// `OwnershipLost` is routine under concurrency, not an error: the lease was
/// reclaimed (or the job cancelled) and the caller must abandon its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum HeartbeatOutcome {
    Extended,
    OwnershipLost,
}

/// Result of a finalize call. Rejection means another owner took over; the
/// caller discards its result and does not retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum FinalizeOutcome {
    Recorded,
    OwnershipLost,
}

/// Result of an administrative cancel. A job already in a terminal state is
/// left untouched and reported as such.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum CancelOutcome {
    Cancelled,
    AlreadyFinished(JobStatus),
}

/// What a reaper pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Jobs returned to `pending` for another claim cycle
    pub recovered: u64,
    /// Jobs forced to `failed` after exhausting `max_attempts`
    pub moved_to_failed: u64,
}

/// Per-tenant job counts, for dashboards and admin endpoints.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}
