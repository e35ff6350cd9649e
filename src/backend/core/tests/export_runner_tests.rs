//! Export runner tests against the in-memory store.
//!
//! Tests cover:
//! - Per-tenant and global concurrency deferral
//! - Retry backoff and the attempts ceiling
//! - Execution-time authorization
//! - Runtime guardrail
//! - Stale job recovery
//! - Exclusive claims under concurrent runners

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sitegate_core::clock::ManualClock;
use sitegate_core::error::{ErrorCode, Result, SitegateError};
use sitegate_core::guardrails::GuardrailConfig;
use sitegate_core::jobs::{
    AuditAction, ContentGenerator, CsvExport, DeferReason, ExportFailure, ExportGenerators,
    ExportJob, ExportJobStatus, ExportJobType, ExportLimits, ExportRunner, GeneratedContent,
    InMemoryAuditSink, InMemoryJobStore, JobOutcome, JobStore, Requester, RequesterDirectory,
    TenantId, UserId, UserRole,
};
use sitegate_core::storage::MemoryStorage;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Default)]
struct Directory {
    users: HashMap<UserId, Requester>,
    unavailable: AtomicBool,
}

#[async_trait]
impl RequesterDirectory for Directory {
    async fn find(&self, tenant_id: TenantId, user_id: UserId) -> Result<Option<Requester>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SitegateError::new(ErrorCode::DatabaseQueryFailed, "directory offline"));
        }
        Ok(self
            .users
            .get(&user_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }
}

/// Emits `rows` numbered rows.
struct NumberedRows(u64);

#[async_trait]
impl ContentGenerator for NumberedRows {
    async fn generate(
        &self,
        _tenant_id: TenantId,
        _params: &serde_json::Value,
        limits: ExportLimits,
    ) -> std::result::Result<GeneratedContent, ExportFailure> {
        let mut export = CsvExport::new(&["row"], limits)?;
        for n in 0..self.0 {
            export.push_row([n.to_string()])?;
        }
        export.finish()
    }
}

/// Never finishes within any sane runtime limit.
struct Stalled;

#[async_trait]
impl ContentGenerator for Stalled {
    async fn generate(
        &self,
        _tenant_id: TenantId,
        _params: &serde_json::Value,
        _limits: ExportLimits,
    ) -> std::result::Result<GeneratedContent, ExportFailure> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(GeneratedContent {
            bytes: Vec::new(),
            rows: 0,
        })
    }
}

struct World {
    clock: ManualClock,
    store: Arc<InMemoryJobStore>,
    storage: Arc<MemoryStorage>,
    audit: Arc<InMemoryAuditSink>,
    directory: Arc<Directory>,
    guardrails: Arc<GuardrailConfig>,
}

fn guardrails(vars: &[(&str, &str)]) -> GuardrailConfig {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    GuardrailConfig::from_lookup(|key| vars.get(key).cloned())
}

impl World {
    fn new(users: Vec<Requester>, guardrails: GuardrailConfig) -> Self {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 4, 10, 21, 30, 0).unwrap());
        Self {
            store: Arc::new(InMemoryJobStore::with_clock(clock.clock())),
            storage: Arc::new(MemoryStorage::new()),
            audit: Arc::new(InMemoryAuditSink::new()),
            directory: Arc::new(Directory {
                users: users.into_iter().map(|r| (r.id, r)).collect(),
                unavailable: AtomicBool::new(false),
            }),
            guardrails: Arc::new(guardrails),
            clock,
        }
    }

    fn runner(&self, generators: ExportGenerators) -> ExportRunner {
        ExportRunner::new(
            self.store.clone(),
            self.directory.clone(),
            self.audit.clone(),
            generators,
            self.storage.clone(),
            self.guardrails.clone(),
        )
        .with_clock(self.clock.clock())
    }

    fn rows_runner(&self, rows: u64) -> ExportRunner {
        self.runner(ExportGenerators::from_fn(move |_| Arc::new(NumberedRows(rows))))
    }

    async fn enqueue(&self, requester: &Requester) -> ExportJob {
        let job = ExportJob::new(requester.tenant_id, ExportJobType::SignInRegister, requester.id)
            .queued_at(self.clock.now());
        self.store.enqueue(job.clone()).await.unwrap();
        // Keep queue order deterministic.
        self.clock.advance(Duration::from_millis(1));
        job
    }

    async fn job(&self, job: &ExportJob) -> ExportJob {
        self.store.get(job.tenant_id, job.id).await.unwrap().unwrap()
    }
}

fn admin(tenant_id: TenantId) -> Requester {
    Requester {
        id: UserId::new(),
        tenant_id,
        role: UserRole::Admin,
        is_active: true,
    }
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_second_job_of_busy_tenant_is_deferred() {
    let alice = admin(TenantId::new());
    let world = World::new(vec![alice.clone()], GuardrailConfig::default());
    let first = world.enqueue(&alice).await;
    let second = world.enqueue(&alice).await;

    // Another worker holds the first job.
    let held = world.store.claim_next_queued().await.unwrap().unwrap();
    assert_eq!(held.id, first.id);

    let processed = world.rows_runner(1).process_next_export_job().await.unwrap();
    assert_eq!(processed.id, second.id);
    assert_eq!(processed.outcome, JobOutcome::Deferred(DeferReason::TenantConcurrency));

    let deferred = world.job(&second).await;
    assert_eq!(deferred.status, ExportJobStatus::Queued);
    assert_eq!(deferred.attempts, 0);
    assert_eq!(deferred.available_at, world.clock.now() + chrono::Duration::seconds(30));
    assert_eq!(world.job(&first).await.status, ExportJobStatus::Running);
}

#[tokio::test]
async fn test_global_limit_defers_other_tenants() {
    let alice = admin(TenantId::new());
    let bob = admin(TenantId::new());
    let world = World::new(vec![alice.clone(), bob.clone()], GuardrailConfig::default());
    world.enqueue(&alice).await;
    let bobs = world.enqueue(&bob).await;
    world.store.claim_next_queued().await.unwrap().unwrap();

    let processed = world.rows_runner(1).process_next_export_job().await.unwrap();
    assert_eq!(processed.id, bobs.id);
    assert_eq!(processed.outcome, JobOutcome::Deferred(DeferReason::GlobalConcurrency));
    assert_eq!(world.job(&bobs).await.attempts, 0);
}

#[tokio::test]
async fn test_raised_limits_let_jobs_overlap() {
    let alice = admin(TenantId::new());
    let world = World::new(
        vec![alice.clone()],
        guardrails(&[
            ("MAX_CONCURRENT_EXPORTS_GLOBAL", "4"),
            ("MAX_CONCURRENT_EXPORTS_PER_COMPANY", "2"),
        ]),
    );
    world.enqueue(&alice).await;
    let second = world.enqueue(&alice).await;
    world.store.claim_next_queued().await.unwrap().unwrap();

    let processed = world.rows_runner(1).process_next_export_job().await.unwrap();
    assert_eq!(processed.id, second.id);
    assert_eq!(processed.outcome, JobOutcome::Succeeded);
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn test_backoff_hides_job_until_delay_passes() {
    let alice = admin(TenantId::new());
    let world = World::new(vec![alice.clone()], guardrails(&[("MAX_EXPORT_ROWS", "3")]));
    let job = world.enqueue(&alice).await;
    let runner = world.rows_runner(10);

    let first = runner.process_next_export_job().await.unwrap();
    assert_eq!(
        first.outcome,
        JobOutcome::Retrying {
            attempts: 1,
            delay: Duration::from_secs(2)
        }
    );
    assert!(runner.process_next_export_job().await.is_none());

    world.clock.advance(Duration::from_secs(2));
    let second = runner.process_next_export_job().await.unwrap();
    assert_eq!(
        second.outcome,
        JobOutcome::Retrying {
            attempts: 2,
            delay: Duration::from_secs(4)
        }
    );

    world.clock.advance(Duration::from_secs(4));
    let third = runner.process_next_export_job().await.unwrap();
    assert_eq!(third.outcome, JobOutcome::Failed { attempts: 3 });

    let failed = world.job(&job).await;
    assert_eq!(failed.status, ExportJobStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert!(failed.file.is_none());
    assert!(world.storage.is_empty());

    let actions: Vec<_> = world.audit.events().await.iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![AuditAction::ExportFailed]);
}

#[tokio::test]
async fn test_byte_guardrail_counts_as_attempt() {
    let alice = admin(TenantId::new());
    let world = World::new(vec![alice.clone()], guardrails(&[("MAX_EXPORT_BYTES", "8")]));
    let job = world.enqueue(&alice).await;

    let processed = world.rows_runner(20).process_next_export_job().await.unwrap();
    assert!(matches!(processed.outcome, JobOutcome::Retrying { attempts: 1, .. }));
    assert!(world.job(&job).await.error_message.unwrap().contains("bytes"));
}

#[tokio::test]
async fn test_directory_outage_counts_as_attempt() {
    let alice = admin(TenantId::new());
    let world = World::new(vec![alice.clone()], GuardrailConfig::default());
    world.directory.unavailable.store(true, Ordering::SeqCst);
    let job = world.enqueue(&alice).await;

    let processed = world.rows_runner(1).process_next_export_job().await.unwrap();
    assert!(matches!(processed.outcome, JobOutcome::Retrying { attempts: 1, .. }));

    world.directory.unavailable.store(false, Ordering::SeqCst);
    world.clock.advance(Duration::from_secs(2));
    let processed = world.rows_runner(1).process_next_export_job().await.unwrap();
    assert_eq!(processed.outcome, JobOutcome::Succeeded);
    assert_eq!(world.job(&job).await.attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_runtime_guardrail_abandons_slow_export() {
    let alice = admin(TenantId::new());
    let world = World::new(
        vec![alice.clone()],
        guardrails(&[("MAX_EXPORT_RUNTIME_SECONDS", "1")]),
    );
    let job = world.enqueue(&alice).await;

    let processed = world
        .runner(ExportGenerators::from_fn(|_| Arc::new(Stalled)))
        .process_next_export_job()
        .await
        .unwrap();
    assert!(matches!(processed.outcome, JobOutcome::Retrying { attempts: 1, .. }));
    assert!(world.job(&job).await.error_message.unwrap().contains("runtime"));
    assert!(world.storage.is_empty());
}

// ============================================================================
// Authorization
// ============================================================================

#[tokio::test]
async fn test_requester_removed_after_enqueue_is_denied() {
    let tenant = TenantId::new();
    let ghost = admin(tenant);
    let world = World::new(Vec::new(), GuardrailConfig::default());
    let job = world.enqueue(&ghost).await;

    let processed = world.rows_runner(1).process_next_export_job().await.unwrap();
    assert_eq!(processed.outcome, JobOutcome::Denied);

    let denied = world.job(&job).await;
    assert_eq!(denied.status, ExportJobStatus::Failed);
    assert_eq!(denied.attempts, 0);

    let events = world.audit.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, AuditAction::ExportDenied);
    assert_eq!(events[0].details["reason"], "requester_missing");
}

#[tokio::test]
async fn test_requester_from_another_tenant_is_denied() {
    let alice = admin(TenantId::new());
    let world = World::new(vec![alice.clone()], GuardrailConfig::default());
    let impostor = Requester {
        tenant_id: TenantId::new(),
        ..alice.clone()
    };
    world.enqueue(&impostor).await;

    let processed = world.rows_runner(1).process_next_export_job().await.unwrap();
    assert_eq!(processed.outcome, JobOutcome::Denied);
}

// ============================================================================
// Artifacts
// ============================================================================

#[tokio::test]
async fn test_artifact_is_stored_under_tenant() {
    let alice = admin(TenantId::new());
    let world = World::new(vec![alice.clone()], GuardrailConfig::default());
    let job = world.enqueue(&alice).await;

    world.rows_runner(2).process_next_export_job().await.unwrap();

    let done = world.job(&job).await;
    let file = done.file.unwrap();
    assert!(file.path.starts_with(&alice.tenant_id.to_string()));
    assert_eq!(file.size, b"row\n0\n1\n".len() as u64);
    assert_eq!(world.storage.get(&file.path).unwrap(), b"row\n0\n1\n");
    assert!(done.error_message.is_none());
}

// ============================================================================
// Recovery and Exclusivity
// ============================================================================

#[tokio::test]
async fn test_stale_running_job_is_recovered() {
    let alice = admin(TenantId::new());
    let world = World::new(vec![alice.clone()], GuardrailConfig::default());
    let job = world.enqueue(&alice).await;

    // A worker crashed after claiming.
    world.store.claim_next_queued().await.unwrap().unwrap();
    assert!(world.rows_runner(1).process_next_export_job().await.is_none());

    world.clock.advance(world.guardrails.export_stale_timeout + Duration::from_secs(1));
    let processed = world.rows_runner(1).process_next_export_job().await.unwrap();
    assert_eq!(processed.id, job.id);
    assert_eq!(processed.outcome, JobOutcome::Succeeded);
    assert_eq!(world.job(&job).await.attempts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runners_never_share_a_job() {
    let tenants: Vec<Requester> = (0..8).map(|_| admin(TenantId::new())).collect();
    let world = World::new(
        tenants.clone(),
        guardrails(&[("MAX_CONCURRENT_EXPORTS_GLOBAL", "100")]),
    );
    for requester in &tenants {
        world.enqueue(requester).await;
    }

    let runner = Arc::new(world.rows_runner(1));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let runner = runner.clone();
            tokio::spawn(async move { runner.process_next_export_job().await })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        if let Some(processed) = handle.await.unwrap() {
            assert!(seen.insert(processed.id), "job processed twice");
        }
    }
    assert_eq!(seen.len(), 8);
    assert!(world
        .store
        .all()
        .await
        .iter()
        .all(|j| j.status == ExportJobStatus::Succeeded));
}
