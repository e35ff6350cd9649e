//! Retention reaper.
//!
//! A sweep purges four targets independently:
//!
//! | Target | Policy | Shape |
//! |---|---|---|
//! | audit logs | global `AUDIT_RETENTION_DAYS` | one bulk delete |
//! | exports | `expires_at` / `EXPORTS_RETENTION_DAYS` | object then row, fanned out |
//! | documents | `expires_at` | object then row, fanned out |
//! | sign-ins | per-tenant `retention_days` | one delete per tenant, fanned out |
//!
//! A failing target or item is logged and counted; the sweep always moves on.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::fan_out::run_bounded;
use super::store::{ExpiredObject, RetentionStore};
use crate::clock::{system_clock, Clock};
use crate::error::Result;
use crate::guardrails::{retention_window, GuardrailConfig, MAX_RETENTION_DAYS};
use crate::jobs::PeriodicTask;
use crate::storage::StorageBackend;

/// Sign-in retention when a tenant sets none.
pub const DEFAULT_SIGN_IN_RETENTION_DAYS: i64 = 365;

/// Data purged by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionTarget {
    AuditLogs,
    Exports,
    Documents,
    SignIns,
}

impl RetentionTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuditLogs => "audit_logs",
            Self::Exports => "exports",
            Self::Documents => "documents",
            Self::SignIns => "sign_ins",
        }
    }
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub audit_logs: u64,
    pub exports: u64,
    pub documents: u64,
    pub sign_ins: u64,
    /// Failed targets and items
    pub failures: u64,
}

impl RetentionReport {
    pub fn total_deleted(&self) -> u64 {
        self.audit_logs + self.exports + self.documents + self.sign_ins
    }
}

/// Sign-in cutoff of a tenant: `now - max(days, 1)` where unset or
/// non-positive `retention_days` means 365.
///
/// `None` when the window is longer than [`MAX_RETENTION_DAYS`] or does not
/// fit the calendar; nothing is purged for that tenant.
pub fn sign_in_cutoff(now: DateTime<Utc>, retention_days: Option<i32>) -> Option<DateTime<Utc>> {
    let days = retention_days
        .filter(|d| *d > 0)
        .map(i64::from)
        .unwrap_or(DEFAULT_SIGN_IN_RETENTION_DAYS)
        .max(1);
    if days > i64::from(MAX_RETENTION_DAYS) {
        return None;
    }
    ChronoDuration::try_days(days).and_then(|window| now.checked_sub_signed(window))
}

pub struct RetentionReaper {
    store: Arc<dyn RetentionStore>,
    storage: Arc<dyn StorageBackend>,
    guardrails: Arc<GuardrailConfig>,
    clock: Clock,
}

impl RetentionReaper {
    pub fn new(
        store: Arc<dyn RetentionStore>,
        storage: Arc<dyn StorageBackend>,
        guardrails: Arc<GuardrailConfig>,
    ) -> Self {
        Self {
            store,
            storage,
            guardrails,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn concurrency(&self) -> usize {
        self.guardrails.tier.retention_concurrency()
    }

    /// Run one full sweep.
    #[instrument(skip(self), name = "retention_reaper.sweep")]
    pub async fn sweep(&self) -> RetentionReport {
        let now = (self.clock)();
        let mut report = RetentionReport::default();

        match self.store.purge_audit_logs(self.guardrails.audit_cutoff(now)).await {
            Ok(deleted) => {
                report.audit_logs = deleted;
                record_deleted(RetentionTarget::AuditLogs, deleted);
            }
            Err(e) => {
                e.log();
                report.failures += record_failures(RetentionTarget::AuditLogs, 1);
            }
        }

        let failed_cutoff = retention_window(self.guardrails.exports_retention_days)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let exports = self
            .store
            .list_expired_exports(now, failed_cutoff, self.guardrails.retention_batch_size)
            .await;
        let (deleted, failed) = self.purge_objects(RetentionTarget::Exports, exports).await;
        report.exports = deleted;
        report.failures += failed;

        let documents = self
            .store
            .list_expired_documents(now, self.guardrails.retention_batch_size)
            .await;
        let (deleted, failed) = self.purge_objects(RetentionTarget::Documents, documents).await;
        report.documents = deleted;
        report.failures += failed;

        let (deleted, failed) = self.purge_sign_ins(now).await;
        report.sign_ins = deleted;
        report.failures += failed;

        info!(
            audit_logs = report.audit_logs,
            exports = report.exports,
            documents = report.documents,
            sign_ins = report.sign_ins,
            failures = report.failures,
            "Retention sweep finished"
        );
        report
    }

    /// Two-phase purge: stored object first, then the row.
    async fn purge_objects(
        &self,
        target: RetentionTarget,
        listed: Result<Vec<ExpiredObject>>,
    ) -> (u64, u64) {
        let items = match listed {
            Ok(items) => items,
            Err(e) => {
                e.log();
                return (0, record_failures(target, 1));
            }
        };

        let results = run_bounded(&items, self.concurrency(), |item| self.purge_object(target, item)).await;
        let deleted = results.iter().filter(|ok| **ok).count() as u64;
        let failed = results.len() as u64 - deleted;

        record_deleted(target, deleted);
        (deleted, record_failures(target, failed))
    }

    async fn purge_object(&self, target: RetentionTarget, item: &ExpiredObject) -> bool {
        if let Some(path) = &item.path {
            if let Err(e) = self.storage.delete(path).await {
                warn!(
                    target_kind = target.as_str(),
                    id = %item.id,
                    tenant_id = %item.tenant_id,
                    error = %e,
                    "Failed to delete stored object"
                );
                return false;
            }
        }

        let deleted = match target {
            RetentionTarget::Documents => self.store.delete_document_row(item.tenant_id, item.id).await,
            _ => self.store.delete_export_row(item.tenant_id, item.id).await,
        };
        if let Err(e) = deleted {
            // The object is gone; the row stays selectable for the next sweep.
            warn!(
                target_kind = target.as_str(),
                id = %item.id,
                tenant_id = %item.tenant_id,
                error = %e,
                "Failed to delete row after removing its object"
            );
            return false;
        }
        true
    }

    async fn purge_sign_ins(&self, now: DateTime<Utc>) -> (u64, u64) {
        let target = RetentionTarget::SignIns;
        let tenants = match self.store.list_tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                e.log();
                return (0, record_failures(target, 1));
            }
        };

        let results = run_bounded(&tenants, self.concurrency(), |tenant| {
            let tenant = *tenant;
            async move {
                let Some(cutoff) = sign_in_cutoff(now, tenant.retention_days) else {
                    debug!(
                        tenant_id = %tenant.tenant_id,
                        retention_days = ?tenant.retention_days,
                        "Sign-in retention window too long, nothing to purge"
                    );
                    return Ok(0);
                };
                self.store
                    .purge_sign_ins(tenant.tenant_id, cutoff)
                    .await
                    .map_err(|e| {
                        warn!(tenant_id = %tenant.tenant_id, error = %e, "Failed to purge sign-in records");
                    })
            }
        })
        .await;

        let deleted: u64 = results.iter().filter_map(|r| r.as_ref().ok()).sum();
        let failed = results.iter().filter(|r| r.is_err()).count() as u64;

        record_deleted(target, deleted);
        (deleted, record_failures(target, failed))
    }
}

fn record_deleted(target: RetentionTarget, count: u64) {
    if count > 0 {
        counter!("sitegate_retention_deleted_total", "target" => target.as_str()).increment(count);
    }
}

fn record_failures(target: RetentionTarget, count: u64) -> u64 {
    if count > 0 {
        counter!("sitegate_retention_failures_total", "target" => target.as_str()).increment(count);
    }
    count
}

#[async_trait]
impl PeriodicTask for RetentionReaper {
    type Output = RetentionReport;

    fn name(&self) -> &'static str {
        "retention_reaper"
    }

    async fn run_once(&self) -> RetentionReport {
        self.sweep().await
    }
}
