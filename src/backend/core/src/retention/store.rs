//! Data access for the retention reaper.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::error::{ErrorCode, Result, SitegateError};
use crate::jobs::TenantId;

/// A row whose stored object must be deleted before the row itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredObject {
    pub id: Uuid,
    pub tenant_id: TenantId,
    /// Storage key; `None` when nothing was ever stored
    pub path: Option<String>,
}

/// Per-tenant sign-in retention setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantRetention {
    pub tenant_id: TenantId,
    pub retention_days: Option<i32>,
}

#[async_trait]
pub trait RetentionStore: Send + Sync {
    /// Delete audit rows created before `cutoff`.
    async fn purge_audit_logs(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// SUCCEEDED exports past `expires_at`, and FAILED exports completed
    /// before `failed_cutoff`.
    async fn list_expired_exports(
        &self,
        now: DateTime<Utc>,
        failed_cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ExpiredObject>>;

    async fn delete_export_row(&self, tenant_id: TenantId, id: Uuid) -> Result<()>;

    /// Contractor documents past `expires_at`.
    async fn list_expired_documents(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ExpiredObject>>;

    async fn delete_document_row(&self, tenant_id: TenantId, id: Uuid) -> Result<()>;

    async fn list_tenants(&self) -> Result<Vec<TenantRetention>>;

    /// Delete a tenant's signed-out records older than `cutoff`.
    async fn purge_sign_ins(&self, tenant_id: TenantId, cutoff: DateTime<Utc>) -> Result<u64>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// PostgreSQL Store
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct PgRetentionStore {
    pool: PgPool,
}

impl PgRetentionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_expired(rows: Vec<(Uuid, Uuid, Option<String>)>) -> Vec<ExpiredObject> {
    rows.into_iter()
        .map(|(id, tenant_id, path)| ExpiredObject {
            id,
            tenant_id: TenantId(tenant_id),
            path,
        })
        .collect()
}

#[async_trait]
impl RetentionStore for PgRetentionStore {
    async fn purge_audit_logs(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_expired_exports(
        &self,
        now: DateTime<Utc>,
        failed_cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ExpiredObject>> {
        let rows: Vec<(Uuid, Uuid, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, file_path
            FROM export_jobs
            WHERE (status = 'SUCCEEDED' AND expires_at < $1)
               OR (status = 'FAILED' AND completed_at < $2)
            ORDER BY completed_at
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(failed_cutoff)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(to_expired(rows))
    }

    async fn delete_export_row(&self, tenant_id: TenantId, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM export_jobs WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.0)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_expired_documents(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ExpiredObject>> {
        let rows: Vec<(Uuid, Uuid, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, company_id, file_path
            FROM contractor_documents
            WHERE expires_at < $1
            ORDER BY expires_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(to_expired(rows))
    }

    async fn delete_document_row(&self, tenant_id: TenantId, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM contractor_documents WHERE company_id = $1 AND id = $2")
            .bind(tenant_id.0)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<TenantRetention>> {
        let rows: Vec<(Uuid, Option<i32>)> =
            sqlx::query_as("SELECT id, retention_days FROM companies ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(id, retention_days)| TenantRetention {
                tenant_id: TenantId(id),
                retention_days,
            })
            .collect())
    }

    async fn purge_sign_ins(&self, tenant_id: TenantId, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sign_in_records
            WHERE company_id = $1 AND sign_out_ts IS NOT NULL AND sign_out_ts < $2
            "#,
        )
        .bind(tenant_id.0)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Export row as seen by the reaper.
#[derive(Debug, Clone)]
pub struct ExportRow {
    pub object: ExpiredObject,
    pub succeeded: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Contractor document row.
#[derive(Debug, Clone)]
pub struct DocumentRow {
    pub object: ExpiredObject,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Sign-in record row.
#[derive(Debug, Clone)]
pub struct SignInRow {
    pub tenant_id: TenantId,
    pub sign_out_ts: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Tables {
    audit_logs: Vec<DateTime<Utc>>,
    exports: Vec<ExportRow>,
    documents: Vec<DocumentRow>,
    tenants: Vec<TenantRetention>,
    sign_ins: Vec<SignInRow>,
}

/// Retention store over in-memory tables. Row deletes can be switched to fail.
#[derive(Default)]
pub struct InMemoryRetentionStore {
    tables: Mutex<Tables>,
    fail_row_deletes: AtomicBool,
    fail_audit_purge: AtomicBool,
}

impl InMemoryRetentionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_audit_log(&self, created_at: DateTime<Utc>) {
        self.tables.lock().audit_logs.push(created_at);
    }

    pub fn add_export(&self, row: ExportRow) {
        self.tables.lock().exports.push(row);
    }

    pub fn add_document(&self, row: DocumentRow) {
        self.tables.lock().documents.push(row);
    }

    pub fn add_tenant(&self, tenant: TenantRetention) {
        self.tables.lock().tenants.push(tenant);
    }

    pub fn add_sign_in(&self, row: SignInRow) {
        self.tables.lock().sign_ins.push(row);
    }

    pub fn audit_log_count(&self) -> usize {
        self.tables.lock().audit_logs.len()
    }

    pub fn export_ids(&self) -> Vec<Uuid> {
        self.tables.lock().exports.iter().map(|r| r.object.id).collect()
    }

    pub fn document_ids(&self) -> Vec<Uuid> {
        self.tables.lock().documents.iter().map(|r| r.object.id).collect()
    }

    pub fn sign_in_count(&self, tenant_id: TenantId) -> usize {
        self.tables
            .lock()
            .sign_ins
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .count()
    }

    pub fn set_fail_row_deletes(&self, fail: bool) {
        self.fail_row_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_audit_purge(&self, fail: bool) {
        self.fail_audit_purge.store(fail, Ordering::SeqCst);
    }

    fn check_row_delete(&self) -> Result<()> {
        if self.fail_row_deletes.load(Ordering::SeqCst) {
            return Err(SitegateError::new(
                ErrorCode::DatabaseQueryFailed,
                "row delete disabled",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RetentionStore for InMemoryRetentionStore {
    async fn purge_audit_logs(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        if self.fail_audit_purge.load(Ordering::SeqCst) {
            return Err(SitegateError::new(
                ErrorCode::DatabaseQueryFailed,
                "audit purge disabled",
            ));
        }
        let mut tables = self.tables.lock();
        let before = tables.audit_logs.len();
        tables.audit_logs.retain(|created_at| *created_at >= cutoff);
        Ok((before - tables.audit_logs.len()) as u64)
    }

    async fn list_expired_exports(
        &self,
        now: DateTime<Utc>,
        failed_cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ExpiredObject>> {
        let tables = self.tables.lock();
        Ok(tables
            .exports
            .iter()
            .filter(|r| {
                if r.succeeded {
                    r.expires_at.is_some_and(|at| at < now)
                } else {
                    r.completed_at.is_some_and(|at| at < failed_cutoff)
                }
            })
            .take(limit as usize)
            .map(|r| r.object.clone())
            .collect())
    }

    async fn delete_export_row(&self, tenant_id: TenantId, id: Uuid) -> Result<()> {
        self.check_row_delete()?;
        self.tables
            .lock()
            .exports
            .retain(|r| !(r.object.tenant_id == tenant_id && r.object.id == id));
        Ok(())
    }

    async fn list_expired_documents(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ExpiredObject>> {
        let tables = self.tables.lock();
        Ok(tables
            .documents
            .iter()
            .filter(|r| r.expires_at.is_some_and(|at| at < now))
            .take(limit as usize)
            .map(|r| r.object.clone())
            .collect())
    }

    async fn delete_document_row(&self, tenant_id: TenantId, id: Uuid) -> Result<()> {
        self.check_row_delete()?;
        self.tables
            .lock()
            .documents
            .retain(|r| !(r.object.tenant_id == tenant_id && r.object.id == id));
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<TenantRetention>> {
        Ok(self.tables.lock().tenants.clone())
    }

    async fn purge_sign_ins(&self, tenant_id: TenantId, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock();
        let before = tables.sign_ins.len();
        tables.sign_ins.retain(|r| {
            r.tenant_id != tenant_id || r.sign_out_ts.map_or(true, |out| out >= cutoff)
        });
        Ok((before - tables.sign_ins.len()) as u64)
    }
}
