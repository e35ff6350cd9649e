//! Multi-tenant data retention.
//!
//! The [`RetentionReaper`] runs on its own long interval and removes expired
//! audit logs, export artifacts, contractor documents and sign-in records.
//! Work that touches external storage is fanned out through [`run_bounded`]
//! so a large backlog never turns into an unbounded burst of deletes.

pub mod fan_out;
pub mod reaper;
pub mod store;

pub use fan_out::run_bounded;
pub use reaper::{
    sign_in_cutoff, RetentionReaper, RetentionReport, RetentionTarget,
    DEFAULT_SIGN_IN_RETENTION_DAYS,
};
pub use store::{
    DocumentRow, ExpiredObject, ExportRow, InMemoryRetentionStore, PgRetentionStore,
    RetentionStore, SignInRow, TenantRetention,
};

use crate::jobs::Scheduler;

/// Scheduler driving the retention reaper.
pub type RetentionScheduler = Scheduler<RetentionReaper>;
