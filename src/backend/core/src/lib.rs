#![allow(clippy::result_large_err)]
//! # Sitegate Core
//!
//! Background workers for the site sign-in platform.
//!
//! ## Architecture
//!
//! - **Export Runner**: Claims queued tenant exports, re-checks the requester,
//!   enforces guardrails and writes CSV artifacts to storage
//! - **Retention Reaper**: Periodically purges expired audit logs, export
//!   artifacts, contractor documents and sign-in history
//! - **Scheduler**: Fixed-interval driver shared by both workers
//! - **Guardrails**: Environment-driven limits for exports and retention
//! - **Storage**: Local filesystem or HTTP object store backends
//! - **Telemetry**: Structured logging with secret redaction and Prometheus metrics

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod guardrails;
pub mod jobs;
pub mod retention;
pub mod storage;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorSeverity, Result, SitegateError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{system_clock, Clock, ManualClock};
    pub use crate::error::{ErrorCode, Result, SitegateError};
    pub use crate::guardrails::{GuardrailConfig, GuardrailTier};
    pub use crate::jobs::{
        ExportGenerators, ExportJob, ExportJobId, ExportJobStatus, ExportJobType, ExportRunner,
        ExportScheduler, JobOutcome, JobStore, PeriodicTask, ProcessedJob, ScheduleOptions,
        TenantId, UserId,
    };
    pub use crate::retention::{RetentionReaper, RetentionReport, RetentionScheduler, RetentionStore};
    pub use crate::storage::{StorageBackend, StoredObject};
}
