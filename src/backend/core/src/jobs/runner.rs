//! Export runner.
//!
//! One invocation of [`ExportRunner::process_next_export_job`] touches at most
//! one job:
//!
//! ```text
//! requeue stale ─▶ claim ─▶ re-authorize ─▶ concurrency ─▶ off-peak ─▶ generate ─▶ store
//!                    │            │               │             │            │          │
//!                  none        FAILED        QUEUED +30s    QUEUED +1h      attempt   SUCCEEDED
//!                                                                          ├─ QUEUED + backoff
//!                                                                          └─ FAILED (ceiling)
//! ```
//!
//! Every failure is recorded on the job. The runner never returns an error.

use async_trait::async_trait;
use metrics::{counter, histogram};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::generator::{ExportGenerators, ExportLimits};
use super::requester::{AuditAction, AuditEvent, AuditSink, RequesterDirectory};
use super::scheduler::PeriodicTask;
use super::store::JobStore;
use super::{
    retry_delay, DeferReason, ExportFailure, ExportFile, ExportJob, GuardrailKind, JobOutcome,
    ProcessedJob,
};
use crate::clock::{system_clock, Clock};
use crate::guardrails::GuardrailConfig;
use crate::storage::StorageBackend;

/// Why a requester was refused at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DenyReason {
    Missing,
    Inactive,
    Forbidden,
}

impl DenyReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "requester_missing",
            Self::Inactive => "requester_inactive",
            Self::Forbidden => "permission_missing",
        }
    }
}

/// Claims and executes export jobs.
pub struct ExportRunner {
    store: Arc<dyn JobStore>,
    directory: Arc<dyn RequesterDirectory>,
    audit: Arc<dyn AuditSink>,
    generators: ExportGenerators,
    storage: Arc<dyn StorageBackend>,
    guardrails: Arc<GuardrailConfig>,
    clock: Clock,
}

impl ExportRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        directory: Arc<dyn RequesterDirectory>,
        audit: Arc<dyn AuditSink>,
        generators: ExportGenerators,
        storage: Arc<dyn StorageBackend>,
        guardrails: Arc<GuardrailConfig>,
    ) -> Self {
        Self {
            store,
            directory,
            audit,
            generators,
            storage,
            guardrails,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Process at most one eligible job.
    ///
    /// Returns the job touched, or `None` when nothing was claimable.
    #[instrument(skip(self), name = "export_runner.process_next")]
    pub async fn process_next_export_job(&self) -> Option<ProcessedJob> {
        self.recover_stale().await;

        let job = match self.store.claim_next_queued().await {
            Ok(Some(job)) => job,
            Ok(None) => return None,
            Err(e) => {
                e.log();
                return None;
            }
        };

        info!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            export_type = %job.job_type,
            attempts = job.attempts,
            "Claimed export job"
        );

        let outcome = self.execute(&job).await;
        counter!("sitegate_export_jobs_total", "outcome" => outcome.label()).increment(1);

        Some(ProcessedJob {
            id: job.id,
            tenant_id: job.tenant_id,
            status: outcome.status(),
            outcome,
        })
    }

    async fn recover_stale(&self) {
        match self.store.requeue_stale(self.guardrails.export_stale_timeout).await {
            Ok(0) => {}
            Ok(count) => {
                counter!("sitegate_stale_jobs_requeued_total").increment(count);
                warn!(count, "Requeued stale export jobs");
            }
            Err(e) => e.log(),
        }
    }

    async fn execute(&self, job: &ExportJob) -> JobOutcome {
        match self.authorize(job).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return self.deny(job, reason).await,
            Err(failure) => return self.fail_attempt(job, failure).await,
        }

        if let Some(reason) = self.deferral(job).await {
            return self.defer(job, reason).await;
        }

        match self.produce(job).await {
            Ok(file) => self.succeed(job, file).await,
            Err(failure) => self.fail_attempt(job, failure).await,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Authorization
    // ─────────────────────────────────────────────────────────────────────────

    async fn authorize(
        &self,
        job: &ExportJob,
    ) -> Result<Result<(), DenyReason>, ExportFailure> {
        let requester = self
            .directory
            .find(job.tenant_id, job.requested_by)
            .await
            .map_err(|e| ExportFailure::Lookup(e.to_string()))?;

        Ok(match requester {
            None => Err(DenyReason::Missing),
            Some(r) if !r.is_active => Err(DenyReason::Inactive),
            Some(r) if !r.can_export() => Err(DenyReason::Forbidden),
            Some(_) => Ok(()),
        })
    }

    async fn deny(&self, job: &ExportJob, reason: DenyReason) -> JobOutcome {
        warn!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            user_id = %job.requested_by,
            reason = reason.as_str(),
            "Export denied at execution time"
        );

        if let Err(e) = self
            .store
            .mark_failed(job.tenant_id, job.id, "Requester is not authorized to export")
            .await
        {
            e.log();
        }
        self.audit(job, AuditAction::ExportDenied, |event| {
            event.with_detail("reason", reason.as_str())
        })
        .await;
        JobOutcome::Denied
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transient Skips
    // ─────────────────────────────────────────────────────────────────────────

    /// Why the job cannot run now, if it cannot.
    ///
    /// The claimed job is already RUNNING, so it is part of both counts.
    async fn deferral(&self, job: &ExportJob) -> Option<DeferReason> {
        let g = &self.guardrails;

        match self.store.count_running(job.tenant_id).await {
            Ok(running) if running > g.max_concurrent_exports_per_company => {
                return Some(DeferReason::TenantConcurrency)
            }
            Ok(_) => {}
            Err(e) => {
                e.log();
                return Some(DeferReason::TenantConcurrency);
            }
        }

        match self.store.count_running_all().await {
            Ok(running) if running > g.max_concurrent_exports_global => {
                return Some(DeferReason::GlobalConcurrency)
            }
            Ok(_) => {}
            Err(e) => {
                e.log();
                return Some(DeferReason::GlobalConcurrency);
            }
        }

        if g.export_offpeak_only && !g.is_offpeak((self.clock)()) {
            return Some(DeferReason::OutsideOffPeak);
        }
        None
    }

    async fn defer(&self, job: &ExportJob, reason: DeferReason) -> JobOutcome {
        let delay = reason.delay();
        info!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            reason = reason.as_str(),
            delay_ms = delay.as_millis() as u64,
            "Deferring export job"
        );
        if let Err(e) = self.store.requeue(job.tenant_id, job.id, delay).await {
            e.log();
        }
        JobOutcome::Deferred(reason)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Generation
    // ─────────────────────────────────────────────────────────────────────────

    async fn produce(&self, job: &ExportJob) -> Result<ExportFile, ExportFailure> {
        let limit = self.guardrails.max_export_runtime;
        let runtime_exceeded = || ExportFailure::GuardrailExceeded {
            kind: GuardrailKind::Runtime,
            limit: limit.as_secs(),
        };

        let generator = self.generators.for_type(job.job_type);
        let limits = ExportLimits::from(self.guardrails.as_ref());
        let started = tokio::time::Instant::now();

        let content = tokio::time::timeout(limit, generator.generate(job.tenant_id, &job.params, limits))
            .await
            .map_err(|_| runtime_exceeded())??;

        let elapsed = started.elapsed();
        histogram!("sitegate_export_duration_seconds").record(elapsed.as_secs_f64());
        if elapsed >= limit {
            return Err(runtime_exceeded());
        }

        let name = job.job_type.file_name(job.id);
        let stored = self
            .storage
            .write(job.tenant_id, &name, &content.bytes)
            .await
            .map_err(|e| ExportFailure::Storage(e.to_string()))?;
        counter!("sitegate_export_bytes_total").increment(stored.size);

        info!(
            job_id = %job.id,
            rows = content.rows,
            size = stored.size,
            elapsed_ms = elapsed.as_millis() as u64,
            "Export generated"
        );
        Ok(ExportFile {
            path: stored.path,
            name,
            size: stored.size,
        })
    }

    async fn succeed(&self, job: &ExportJob, file: ExportFile) -> JobOutcome {
        let expires_at = self.guardrails.export_expiry_date((self.clock)());
        if let Err(e) = self
            .store
            .mark_succeeded(job.tenant_id, job.id, &file, expires_at)
            .await
        {
            e.log();
        }
        self.audit(job, AuditAction::ExportCompleted, |event| {
            event
                .with_detail("file_name", &file.name)
                .with_detail("size", file.size)
        })
        .await;
        JobOutcome::Succeeded
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Counted Failures
    // ─────────────────────────────────────────────────────────────────────────

    async fn fail_attempt(&self, job: &ExportJob, failure: ExportFailure) -> JobOutcome {
        let message = failure.to_string();
        let attempts = match self.store.record_attempt(job.tenant_id, job.id, &message).await {
            Ok(attempts) => attempts,
            Err(e) => {
                e.log();
                job.attempts.saturating_add(1)
            }
        };

        if attempts >= self.guardrails.max_export_attempts {
            warn!(
                job_id = %job.id,
                tenant_id = %job.tenant_id,
                attempts,
                error_code = %failure.code(),
                error = %message,
                "Export failed permanently"
            );
            if let Err(e) = self.store.mark_failed(job.tenant_id, job.id, &message).await {
                e.log();
            }
            self.audit(job, AuditAction::ExportFailed, |event| {
                event
                    .with_detail("attempts", attempts)
                    .with_detail("error", &message)
            })
            .await;
            return JobOutcome::Failed { attempts };
        }

        let delay = retry_delay(attempts);
        warn!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            attempts,
            delay_ms = delay.as_millis() as u64,
            error_code = %failure.code(),
            error = %message,
            "Export attempt failed, retrying"
        );
        if let Err(e) = self.store.requeue(job.tenant_id, job.id, delay).await {
            e.log();
        }
        JobOutcome::Retrying { attempts, delay }
    }

    async fn audit<F>(&self, job: &ExportJob, action: AuditAction, decorate: F)
    where
        F: FnOnce(AuditEvent) -> AuditEvent,
    {
        let event = decorate(AuditEvent::export(
            action,
            job.tenant_id,
            job.requested_by,
            job.id,
            job.job_type,
            (self.clock)(),
        ));
        if let Err(e) = self.audit.record(event).await {
            warn!(job_id = %job.id, action = action.as_str(), error = %e, "Failed to write audit event");
        }
    }
}

#[async_trait]
impl PeriodicTask for ExportRunner {
    type Output = Option<ProcessedJob>;

    fn name(&self) -> &'static str {
        "export_runner"
    }

    async fn run_once(&self) -> Self::Output {
        let processed = self.process_next_export_job().await;
        if let Some(job) = &processed {
            info!(
                job_id = %job.id,
                tenant_id = %job.tenant_id,
                status = %job.status,
                outcome = job.outcome.label(),
                "Export tick processed a job"
            );
        }
        processed
    }
}
