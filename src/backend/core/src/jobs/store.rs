//! Persistent export job store with atomic claim semantics.
//!
//! The store is the only authority on job state; nothing is queued in memory
//! across restarts. Every transition is a conditional update on the current
//! status, so two workers racing on the same row cannot both win.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ExportFile, ExportJob, ExportJobId, ExportJobStatus, TenantId, UserId};
use crate::clock::{system_clock, Clock};
use crate::error::{ErrorCode, Result, SitegateError};

/// Contract every export job store satisfies.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new QUEUED job.
    async fn enqueue(&self, job: ExportJob) -> Result<()>;

    /// Atomically move the oldest claimable QUEUED job to RUNNING.
    async fn claim_next_queued(&self) -> Result<Option<ExportJob>>;

    /// Number of RUNNING jobs for one tenant.
    async fn count_running(&self, tenant_id: TenantId) -> Result<u64>;

    /// Number of RUNNING jobs across all tenants.
    async fn count_running_all(&self) -> Result<u64>;

    /// RUNNING → SUCCEEDED with artifact metadata.
    async fn mark_succeeded(
        &self,
        tenant_id: TenantId,
        id: ExportJobId,
        file: &ExportFile,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// RUNNING → FAILED (terminal).
    async fn mark_failed(&self, tenant_id: TenantId, id: ExportJobId, message: &str) -> Result<()>;

    /// RUNNING → QUEUED, not claimable for `delay`.
    async fn requeue(&self, tenant_id: TenantId, id: ExportJobId, delay: Duration) -> Result<()>;

    /// Move every RUNNING job started more than `timeout` ago back to QUEUED.
    async fn requeue_stale(&self, timeout: Duration) -> Result<u64>;

    /// Count a failed attempt on a RUNNING job; returns the new attempt count.
    async fn record_attempt(&self, tenant_id: TenantId, id: ExportJobId, message: &str) -> Result<u32>;

    /// Fetch a job by id within its tenant.
    async fn get(&self, tenant_id: TenantId, id: ExportJobId) -> Result<Option<ExportJob>>;
}

fn invalid_transition(id: ExportJobId, to: ExportJobStatus) -> SitegateError {
    SitegateError::new(
        ErrorCode::InvalidStateTransition,
        format!("export job {} is not RUNNING, cannot move to {}", id, to),
    )
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

fn later(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    now.checked_add_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn earlier(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory job store for testing and development.
///
/// A single mutex guards the whole table, which makes every operation
/// (including claim) atomic with respect to concurrent callers.
pub struct InMemoryJobStore {
    jobs: Arc<Mutex<HashMap<ExportJobId, ExportJob>>>,
    clock: Clock,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Snapshot of every job, oldest first.
    pub async fn all(&self) -> Vec<ExportJob> {
        let mut jobs: Vec<ExportJob> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by_key(|j| (j.queued_at, j.id));
        jobs
    }

    /// Apply `apply` to a RUNNING job moving to `to`. Passing RUNNING as `to`
    /// updates the job in place.
    async fn update_running<F>(
        &self,
        tenant_id: TenantId,
        id: ExportJobId,
        to: ExportJobStatus,
        apply: F,
    ) -> Result<ExportJob>
    where
        F: FnOnce(&mut ExportJob),
    {
        let mut jobs = self.jobs.lock().await;
        let job = match jobs.get_mut(&id) {
            Some(job) if job.tenant_id == tenant_id => job,
            _ => return Err(SitegateError::job_not_found(id)),
        };
        let from = job.status;
        let permitted = from == ExportJobStatus::Running && (from == to || from.can_transition_to(to));
        if !permitted {
            return Err(invalid_transition(id, to));
        }
        apply(job);
        Ok(job.clone())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: ExportJob) -> Result<()> {
        self.jobs.lock().await.insert(job.id, job);
        Ok(())
    }

    async fn claim_next_queued(&self) -> Result<Option<ExportJob>> {
        let now = (self.clock)();
        let mut jobs = self.jobs.lock().await;
        let next = jobs
            .values_mut()
            .filter(|j| j.status == ExportJobStatus::Queued && j.available_at <= now)
            .min_by_key(|j| (j.queued_at, j.id));

        Ok(next.map(|job| {
            job.status = ExportJobStatus::Running;
            job.started_at = Some(now);
            job.clone()
        }))
    }

    async fn count_running(&self, tenant_id: TenantId) -> Result<u64> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && j.status == ExportJobStatus::Running)
            .count() as u64)
    }

    async fn count_running_all(&self) -> Result<u64> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|j| j.status == ExportJobStatus::Running)
            .count() as u64)
    }

    async fn mark_succeeded(
        &self,
        tenant_id: TenantId,
        id: ExportJobId,
        file: &ExportFile,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let now = (self.clock)();
        self.update_running(tenant_id, id, ExportJobStatus::Succeeded, |job| {
            job.status = ExportJobStatus::Succeeded;
            job.completed_at = Some(now);
            job.expires_at = Some(expires_at);
            job.file = Some(file.clone());
            job.error_message = None;
        })
        .await
        .map(|_| ())
    }

    async fn mark_failed(&self, tenant_id: TenantId, id: ExportJobId, message: &str) -> Result<()> {
        let now = (self.clock)();
        self.update_running(tenant_id, id, ExportJobStatus::Failed, |job| {
            job.status = ExportJobStatus::Failed;
            job.completed_at = Some(now);
            job.error_message = Some(message.to_string());
        })
        .await
        .map(|_| ())
    }

    async fn requeue(&self, tenant_id: TenantId, id: ExportJobId, delay: Duration) -> Result<()> {
        let available_at = later((self.clock)(), delay);
        self.update_running(tenant_id, id, ExportJobStatus::Queued, |job| {
            job.status = ExportJobStatus::Queued;
            job.started_at = None;
            job.available_at = available_at;
        })
        .await
        .map(|_| ())
    }

    async fn requeue_stale(&self, timeout: Duration) -> Result<u64> {
        let now = (self.clock)();
        let cutoff = earlier(now, timeout);
        let mut jobs = self.jobs.lock().await;
        let mut moved = 0;
        for job in jobs.values_mut() {
            let stale = job.status == ExportJobStatus::Running
                && job.started_at.map_or(true, |started| started < cutoff);
            if stale {
                job.status = ExportJobStatus::Queued;
                job.started_at = None;
                job.available_at = now;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn record_attempt(&self, tenant_id: TenantId, id: ExportJobId, message: &str) -> Result<u32> {
        self.update_running(tenant_id, id, ExportJobStatus::Running, |job| {
            job.attempts += 1;
            job.error_message = Some(message.to_string());
        })
        .await
        .map(|job| job.attempts)
    }

    async fn get(&self, tenant_id: TenantId, id: ExportJobId) -> Result<Option<ExportJob>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.get(&id).filter(|j| j.tenant_id == tenant_id).cloned())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PostgreSQL Store
// ═══════════════════════════════════════════════════════════════════════════════

const JOB_COLUMNS: &str = "id, tenant_id, job_type, status, requested_by, attempts, params, \
     queued_at, available_at, started_at, completed_at, expires_at, \
     file_path, file_name, file_size, error_message";

/// Raw `export_jobs` row.
#[derive(Debug, sqlx::FromRow)]
struct ExportJobRow {
    id: Uuid,
    tenant_id: Uuid,
    job_type: String,
    status: String,
    requested_by: Uuid,
    attempts: i32,
    params: serde_json::Value,
    queued_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    file_path: Option<String>,
    file_name: Option<String>,
    file_size: Option<i64>,
    error_message: Option<String>,
}

impl TryFrom<ExportJobRow> for ExportJob {
    type Error = SitegateError;

    fn try_from(row: ExportJobRow) -> Result<Self> {
        let file = match (row.file_path, row.file_name) {
            (Some(path), Some(name)) => Some(ExportFile {
                path,
                name,
                size: row.file_size.unwrap_or(0).max(0) as u64,
            }),
            _ => None,
        };

        Ok(ExportJob {
            id: ExportJobId(row.id),
            tenant_id: TenantId(row.tenant_id),
            job_type: row.job_type.parse()?,
            status: row.status.parse()?,
            requested_by: UserId(row.requested_by),
            attempts: row.attempts.max(0) as u32,
            params: row.params,
            queued_at: row.queued_at,
            available_at: row.available_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            expires_at: row.expires_at,
            file,
            error_message: row.error_message,
        })
    }
}

/// PostgreSQL-backed job store for production use.
///
/// Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers in separate
/// processes never receive the same row.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn ensure_transitioned(rows: u64, id: ExportJobId, to: ExportJobStatus) -> Result<()> {
        if rows == 0 {
            return Err(invalid_transition(id, to));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: ExportJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO export_jobs
                (id, tenant_id, job_type, status, requested_by, attempts, params, queued_at, available_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id.0)
        .bind(job.tenant_id.0)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.requested_by.0)
        .bind(job.attempts as i32)
        .bind(&job.params)
        .bind(job.queued_at)
        .bind(job.available_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(job_id = %job.id, tenant_id = %job.tenant_id, "Export job enqueued");
        Ok(())
    }

    async fn claim_next_queued(&self) -> Result<Option<ExportJob>> {
        let query = format!(
            r#"
            UPDATE export_jobs
            SET status = 'RUNNING', started_at = NOW()
            WHERE id = (
                SELECT id FROM export_jobs
                WHERE status = 'QUEUED' AND available_at <= NOW()
                ORDER BY queued_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, ExportJobRow>(&query)
            .fetch_optional(&self.pool)
            .await?;

        row.map(ExportJob::try_from).transpose()
    }

    async fn count_running(&self, tenant_id: TenantId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM export_jobs WHERE tenant_id = $1 AND status = 'RUNNING'",
        )
        .bind(tenant_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_running_all(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM export_jobs WHERE status = 'RUNNING'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn mark_succeeded(
        &self,
        tenant_id: TenantId,
        id: ExportJobId,
        file: &ExportFile,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'SUCCEEDED',
                completed_at = NOW(),
                expires_at = $3,
                file_path = $4,
                file_name = $5,
                file_size = $6,
                error_message = NULL
            WHERE tenant_id = $1 AND id = $2 AND status = 'RUNNING'
            "#,
        )
        .bind(tenant_id.0)
        .bind(id.0)
        .bind(expires_at)
        .bind(&file.path)
        .bind(&file.name)
        .bind(file.size as i64)
        .execute(&self.pool)
        .await?;

        Self::ensure_transitioned(result.rows_affected(), id, ExportJobStatus::Succeeded)
    }

    async fn mark_failed(&self, tenant_id: TenantId, id: ExportJobId, message: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'FAILED', completed_at = NOW(), error_message = $3
            WHERE tenant_id = $1 AND id = $2 AND status = 'RUNNING'
            "#,
        )
        .bind(tenant_id.0)
        .bind(id.0)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Self::ensure_transitioned(result.rows_affected(), id, ExportJobStatus::Failed)
    }

    async fn requeue(&self, tenant_id: TenantId, id: ExportJobId, delay: Duration) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'QUEUED',
                started_at = NULL,
                available_at = NOW() + make_interval(secs => $3)
            WHERE tenant_id = $1 AND id = $2 AND status = 'RUNNING'
            "#,
        )
        .bind(tenant_id.0)
        .bind(id.0)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Self::ensure_transitioned(result.rows_affected(), id, ExportJobStatus::Queued)
    }

    async fn requeue_stale(&self, timeout: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'QUEUED', started_at = NULL, available_at = NOW()
            WHERE status = 'RUNNING'
              AND (started_at IS NULL OR started_at < NOW() - make_interval(secs => $1))
            "#,
        )
        .bind(timeout.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn record_attempt(&self, tenant_id: TenantId, id: ExportJobId, message: &str) -> Result<u32> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE export_jobs
            SET attempts = attempts + 1, error_message = $3
            WHERE tenant_id = $1 AND id = $2 AND status = 'RUNNING'
            RETURNING attempts
            "#,
        )
        .bind(tenant_id.0)
        .bind(id.0)
        .bind(message)
        .fetch_optional(&self.pool)
        .await?;

        attempts
            .map(|a| a.max(0) as u32)
            .ok_or_else(|| invalid_transition(id, ExportJobStatus::Running))
    }

    async fn get(&self, tenant_id: TenantId, id: ExportJobId) -> Result<Option<ExportJob>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM export_jobs WHERE tenant_id = $1 AND id = $2");
        let row = sqlx::query_as::<_, ExportJobRow>(&query)
            .bind(tenant_id.0)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(ExportJob::try_from).transpose()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::ExportJobType;
    use chrono::TimeZone;

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
    }

    fn job_at(tenant: TenantId, at: DateTime<Utc>) -> ExportJob {
        ExportJob::new(tenant, ExportJobType::SignInRegister, UserId::new()).queued_at(at)
    }

    #[tokio::test]
    async fn test_claim_oldest_first() {
        let manual = clock();
        let store = InMemoryJobStore::with_clock(manual.clock());
        let tenant = TenantId::new();
        let newer = job_at(tenant, manual.now() - chrono::Duration::minutes(1));
        let older = job_at(tenant, manual.now() - chrono::Duration::minutes(5));
        store.enqueue(newer.clone()).await.unwrap();
        store.enqueue(older.clone()).await.unwrap();

        let claimed = store.claim_next_queued().await.unwrap().unwrap();
        assert_eq!(claimed.id, older.id);
        assert_eq!(claimed.status, ExportJobStatus::Running);
        assert_eq!(claimed.started_at, Some(manual.now()));
        assert_eq!(store.count_running(tenant).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_empty_returns_none() {
        let store = InMemoryJobStore::new();
        assert!(store.claim_next_queued().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requeue_delays_claim() {
        let manual = clock();
        let store = InMemoryJobStore::with_clock(manual.clock());
        let tenant = TenantId::new();
        let job = job_at(tenant, manual.now());
        store.enqueue(job.clone()).await.unwrap();

        store.claim_next_queued().await.unwrap().unwrap();
        store.requeue(tenant, job.id, Duration::from_secs(30)).await.unwrap();
        assert!(store.claim_next_queued().await.unwrap().is_none());

        manual.advance(Duration::from_secs(30));
        let again = store.claim_next_queued().await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
    }

    #[tokio::test]
    async fn test_requeue_stale_is_idempotent() {
        let manual = clock();
        let store = InMemoryJobStore::with_clock(manual.clock());
        let tenant = TenantId::new();
        for _ in 0..2 {
            store.enqueue(job_at(tenant, manual.now())).await.unwrap();
        }
        store.claim_next_queued().await.unwrap().unwrap();
        manual.advance(Duration::from_secs(10));
        store.claim_next_queued().await.unwrap().unwrap();

        manual.advance(Duration::from_secs(235));
        // Only the first claim is older than 240s.
        assert_eq!(store.requeue_stale(Duration::from_secs(240)).await.unwrap(), 1);
        assert_eq!(store.requeue_stale(Duration::from_secs(240)).await.unwrap(), 0);
        assert_eq!(store.count_running_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transitions_require_running() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let job = job_at(tenant, Utc::now());
        store.enqueue(job.clone()).await.unwrap();

        let err = store.mark_failed(tenant, job.id, "nope").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);

        let err = store.mark_failed(TenantId::new(), job.id, "nope").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotFound);

        let err = store
            .record_attempt(tenant, ExportJobId::new(), "nope")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotFound);
    }

    #[tokio::test]
    async fn test_record_attempt_and_succeed() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let job = job_at(tenant, Utc::now());
        store.enqueue(job.clone()).await.unwrap();
        store.claim_next_queued().await.unwrap();

        assert_eq!(store.record_attempt(tenant, job.id, "boom").await.unwrap(), 1);
        assert_eq!(store.record_attempt(tenant, job.id, "boom").await.unwrap(), 2);

        let file = ExportFile {
            path: format!("{}/x.csv", tenant),
            name: "x.csv".into(),
            size: 12,
        };
        let expires = Utc::now();
        store.mark_succeeded(tenant, job.id, &file, expires).await.unwrap();

        let stored = store.get(tenant, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExportJobStatus::Succeeded);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.file, Some(file));
        assert_eq!(stored.expires_at, Some(expires));
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let store = Arc::new(InMemoryJobStore::new());
        let tenant = TenantId::new();
        for _ in 0..5 {
            store.enqueue(job_at(tenant, Utc::now())).await.unwrap();
        }

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.claim_next_queued().await.unwrap() })
            })
            .collect();

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.unwrap() {
                claimed.push(job.id);
            }
        }
        claimed.sort();
        let before = claimed.len();
        claimed.dedup();
        assert_eq!(before, 5);
        assert_eq!(claimed.len(), 5);
    }

    #[tokio::test]
    async fn test_extreme_durations_saturate() {
        let manual = clock();
        let store = InMemoryJobStore::with_clock(manual.clock());
        let tenant = TenantId::new();
        let job = job_at(tenant, manual.now());
        store.enqueue(job.clone()).await.unwrap();
        store.claim_next_queued().await.unwrap().unwrap();

        assert_eq!(store.requeue_stale(Duration::from_secs(u64::MAX)).await.unwrap(), 0);

        store.requeue(tenant, job.id, Duration::from_secs(u64::MAX)).await.unwrap();
        let stored = store.get(tenant, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExportJobStatus::Queued);
        assert!(stored.available_at > manual.now());
        assert!(store.claim_next_queued().await.unwrap().is_none());
    }
}
