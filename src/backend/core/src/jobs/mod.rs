//! Export job system.
//!
//! This module provides the tenant export pipeline:
//!
//! - **Job**: Export job model, status machine and retry backoff
//! - **Store**: Persistent job store with atomic claim
//! - **Generator**: Per-type CSV content with row/byte guardrails
//! - **Requester**: Execution-time re-authorization and audit events
//! - **Runner**: Processes one eligible job per invocation
//! - **Scheduler**: Cooperative periodic loop driving runner and reaper
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            Export Pipeline                                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐   │
//! │  │  Scheduler  │───▶│   Runner    │───▶│  Generator  │───▶│   Storage   │   │
//! │  │  (interval) │    │ (one job)   │    │ (CSV, caps) │    │ (artifact)  │   │
//! │  └─────────────┘    └──────┬──────┘    └─────────────┘    └─────────────┘   │
//! │                            │                                                │
//! │                            ▼                                                │
//! │  ┌─────────────────────────────────────────────────────────────────────┐    │
//! │  │           JobStore (claim / requeue / mark_* / requeue_stale)        │    │
//! │  └─────────────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use sitegate_core::jobs::{ExportRunner, ExportScheduler, ScheduleOptions};
//!
//! let runner = Arc::new(ExportRunner::new(store, directory, audit, generators, storage, guardrails));
//! let scheduler = ExportScheduler::new(runner, ScheduleOptions::every(Duration::from_secs(5)));
//! scheduler.start();
//! // ...
//! scheduler.stop();
//! ```

pub mod generator;
pub mod job;
pub mod requester;
pub mod runner;
pub mod scheduler;
pub mod store;

pub use generator::{
    ContentGenerator, CsvExport, ExportGenerators, ExportLimits, GeneratedContent, PgCsvGenerator,
};
pub use job::{
    retry_delay, DeferReason, ExportFailure, ExportFile, ExportJob, ExportJobId, ExportJobStatus,
    ExportJobType, GuardrailKind, JobOutcome, ProcessedJob, TenantId, UserId,
    OFFPEAK_SKIP_DELAY, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS, TRANSIENT_SKIP_DELAY,
};
pub use requester::{
    AuditAction, AuditEvent, AuditSink, InMemoryAuditSink, Permission, PgAuditSink,
    PgRequesterDirectory, Requester, RequesterDirectory, UserRole,
};
pub use runner::ExportRunner;
pub use scheduler::{PeriodicTask, ScheduleOptions, Scheduler, SchedulerHandle};
pub use store::{InMemoryJobStore, JobStore, PgJobStore};

/// Scheduler driving the export runner.
pub type ExportScheduler = Scheduler<ExportRunner>;
