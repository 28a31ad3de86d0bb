//! Async work-dispatch layer: durable jobs, leased claims, crash recovery.
//!
//! The engine is a set of small components over one storage primitive,
//! [`store::JobStore::update_if`]. Claiming, heartbeating, finalizing and
//! reaping are each a single conditional update; all worker coordination
//! reduces to who wins those updates.

pub mod claim;
pub mod client;
pub mod clock;
pub mod config;
pub mod finalize;
pub mod lease;
pub mod reaper;
pub mod store;
pub mod types;
pub mod worker;

pub use claim::ClaimEngine;
pub use client::{QueueClient, QueueError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueueConfig;
pub use finalize::Finalizer;
pub use lease::LeaseManager;
pub use reaper::{Reaper, ReaperHandle};
pub use store::{
    ClaimFilter, InMemoryJobStore, JobPrecondition, JobStore, JobStoreError, JobUpdate,
    PostgresJobStore,
};
pub use types::{
    CancelOutcome, FinalizeOutcome, HeartbeatOutcome, Job, JobOutcome, JobStatus, NewJob,
    QueueStats, RecoveryReport,
};
pub use worker::{HandlerOutcome, HandlerRegistry, JobHandler, Worker, WorkerHandle};
