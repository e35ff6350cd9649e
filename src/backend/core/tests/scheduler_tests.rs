//! Export and retention workers driven through their schedulers.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sitegate_core::clock::ManualClock;
use sitegate_core::error::Result;
use sitegate_core::guardrails::GuardrailConfig;
use sitegate_core::jobs::{
    ContentGenerator, CsvExport, ExportFailure, ExportGenerators, ExportJob, ExportJobStatus,
    ExportJobType, ExportLimits, ExportRunner, ExportScheduler, GeneratedContent,
    InMemoryAuditSink, InMemoryJobStore, JobStore, PeriodicTask, Requester, RequesterDirectory,
    ScheduleOptions, TenantId, UserId, UserRole,
};
use sitegate_core::retention::{InMemoryRetentionStore, RetentionReaper, RetentionScheduler};
use sitegate_core::storage::MemoryStorage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Everyone;

#[async_trait]
impl RequesterDirectory for Everyone {
    async fn find(&self, tenant_id: TenantId, user_id: UserId) -> Result<Option<Requester>> {
        Ok(Some(Requester {
            id: user_id,
            tenant_id,
            role: UserRole::Admin,
            is_active: true,
        }))
    }
}

struct OneRow;

#[async_trait]
impl ContentGenerator for OneRow {
    async fn generate(
        &self,
        tenant_id: TenantId,
        _params: &serde_json::Value,
        limits: ExportLimits,
    ) -> std::result::Result<GeneratedContent, ExportFailure> {
        let mut export = CsvExport::new(&["tenant"], limits)?;
        export.push_row([tenant_id.to_string()])?;
        export.finish()
    }
}

fn export_runner(store: Arc<InMemoryJobStore>, clock: &ManualClock) -> ExportRunner {
    ExportRunner::new(
        store,
        Arc::new(Everyone),
        Arc::new(InMemoryAuditSink::new()),
        ExportGenerators::from_fn(|_| Arc::new(OneRow)),
        Arc::new(MemoryStorage::new()),
        Arc::new(GuardrailConfig::default()),
    )
    .with_clock(clock.clock())
}

/// Let spawned ticks finish; paused time only advances once the runtime idles.
async fn idle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_drains_queue_one_job_per_tick() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 2, 23, 0, 0).unwrap());
    let store = Arc::new(InMemoryJobStore::with_clock(clock.clock()));
    for offset in 0..3 {
        let job = ExportJob::new(TenantId::new(), ExportJobType::HazardRegister, UserId::new())
            .queued_at(clock.now() - chrono::Duration::seconds(10 - offset));
        store.enqueue(job).await.unwrap();
    }

    let scheduler = ExportScheduler::new(
        Arc::new(export_runner(store.clone(), &clock)),
        ScheduleOptions::every(Duration::from_secs(5)).with_immediate(),
    );
    scheduler.start();

    idle().await;
    let done = |jobs: &[ExportJob]| {
        jobs.iter()
            .filter(|j| j.status == ExportJobStatus::Succeeded)
            .count()
    };
    assert_eq!(done(&store.all().await), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    idle().await;
    assert_eq!(done(&store.all().await), 2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    idle().await;
    assert_eq!(done(&store.all().await), 3);

    scheduler.stop();
}

#[tokio::test(start_paused = true)]
async fn test_stopped_scheduler_leaves_queue_alone() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 2, 23, 0, 0).unwrap());
    let store = Arc::new(InMemoryJobStore::with_clock(clock.clock()));
    let scheduler = ExportScheduler::new(
        Arc::new(export_runner(store.clone(), &clock)),
        ScheduleOptions::every(Duration::from_secs(5)),
    );
    scheduler.start();
    scheduler.stop();

    let job = ExportJob::new(TenantId::new(), ExportJobType::IncidentRegister, UserId::new())
        .queued_at(clock.now());
    store.enqueue(job.clone()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    idle().await;
    let stored = store.get(job.tenant_id, job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExportJobStatus::Queued);
}

#[tokio::test]
async fn test_runner_tick_reports_processed_job() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 2, 23, 0, 0).unwrap());
    let store = Arc::new(InMemoryJobStore::with_clock(clock.clock()));
    let runner = export_runner(store.clone(), &clock);
    assert_eq!(runner.name(), "export_runner");
    assert!(runner.run_once().await.is_none());

    let job = ExportJob::new(TenantId::new(), ExportJobType::ContractorRegister, UserId::new())
        .queued_at(clock.now());
    store.enqueue(job.clone()).await.unwrap();
    let processed = runner.run_once().await.unwrap();
    assert_eq!(processed.id, job.id);
    assert_eq!(processed.status, ExportJobStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_retention_runs_on_start_when_configured() {
    let now = Utc.with_ymd_and_hms(2024, 2, 2, 3, 0, 0).unwrap();
    let store = Arc::new(InMemoryRetentionStore::new());
    store.add_audit_log(now - chrono::Duration::days(120));
    store.add_audit_log(now - chrono::Duration::days(1));

    let reaper = RetentionReaper::new(
        store.clone(),
        Arc::new(MemoryStorage::new()),
        Arc::new(GuardrailConfig::default()),
    )
    .with_clock(ManualClock::new(now).clock());

    let scheduler = RetentionScheduler::new(
        Arc::new(reaper),
        ScheduleOptions::every(Duration::from_secs(86_400)).with_immediate(),
    );
    scheduler.start();
    idle().await;

    assert_eq!(store.audit_log_count(), 1);
    scheduler.stop();
}

/// Generator that takes a while, so a tick is still running when shutdown begins.
struct SlowRow {
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl ContentGenerator for SlowRow {
    async fn generate(
        &self,
        tenant_id: TenantId,
        _params: &serde_json::Value,
        limits: ExportLimits,
    ) -> std::result::Result<GeneratedContent, ExportFailure> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut export = CsvExport::new(&["tenant"], limits)?;
        export.push_row([tenant_id.to_string()])?;
        self.finished.store(true, Ordering::SeqCst);
        export.finish()
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_in_flight_export() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 2, 23, 0, 0).unwrap());
    let store = Arc::new(InMemoryJobStore::with_clock(clock.clock()));
    let job = ExportJob::new(TenantId::new(), ExportJobType::HazardRegister, UserId::new())
        .queued_at(clock.now());
    store.enqueue(job.clone()).await.unwrap();

    let finished = Arc::new(AtomicBool::new(false));
    let generator: Arc<dyn ContentGenerator> = Arc::new(SlowRow {
        finished: finished.clone(),
    });
    let runner = ExportRunner::new(
        store.clone(),
        Arc::new(Everyone),
        Arc::new(InMemoryAuditSink::new()),
        ExportGenerators::from_fn(move |_| generator.clone()),
        Arc::new(MemoryStorage::new()),
        Arc::new(GuardrailConfig::default()),
    )
    .with_clock(clock.clock());

    let scheduler = ExportScheduler::new(
        Arc::new(runner),
        ScheduleOptions::every(Duration::from_secs(5)).with_immediate(),
    );
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!finished.load(Ordering::SeqCst));
    let stored = store.get(job.tenant_id, job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExportJobStatus::Running);

    scheduler.shutdown().await;
    assert!(finished.load(Ordering::SeqCst));
    let stored = store.get(job.tenant_id, job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExportJobStatus::Succeeded);
    assert!(!scheduler.is_running());
}
