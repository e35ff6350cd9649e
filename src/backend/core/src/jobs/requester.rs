//! Execution-time re-authorization and audit trail for export jobs.
//!
//! A job is authorized again when it runs, not only when it is enqueued, so
//! a user deactivated or demoted in between cannot still receive an export.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::fmt;
use std::str::FromStr;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ExportJobId, ExportJobType, TenantId, UserId};
use crate::error::{ErrorCode, Result, SitegateError};

// ═══════════════════════════════════════════════════════════════════════════════
// Roles and Permissions
// ═══════════════════════════════════════════════════════════════════════════════

/// Permissions checked by background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ExportData,
    ManageSites,
    ViewRegister,
}

/// Application user roles within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    Admin,
    SiteManager,
    Viewer,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::SiteManager => "SITE_MANAGER",
            Self::Viewer => "VIEWER",
        }
    }

    /// Permissions granted by this role.
    pub fn permissions(&self) -> &'static [Permission] {
        match self {
            Self::Admin => &[
                Permission::ExportData,
                Permission::ManageSites,
                Permission::ViewRegister,
            ],
            Self::SiteManager => &[Permission::ExportData, Permission::ViewRegister],
            Self::Viewer => &[Permission::ViewRegister],
        }
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = SitegateError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ADMIN" => Ok(Self::Admin),
            "SITE_MANAGER" => Ok(Self::SiteManager),
            "VIEWER" => Ok(Self::Viewer),
            other => Err(SitegateError::new(
                ErrorCode::DeserializationError,
                format!("unknown user role: {}", other),
            )),
        }
    }
}

/// The user who requested an export, as seen at execution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub id: UserId,
    pub tenant_id: TenantId,
    pub role: UserRole,
    pub is_active: bool,
}

impl Requester {
    /// Whether this requester may run exports right now.
    pub fn can_export(&self) -> bool {
        self.is_active && self.role.has_permission(Permission::ExportData)
    }
}

/// Lookup of requesters by tenant and id.
#[async_trait]
pub trait RequesterDirectory: Send + Sync {
    async fn find(&self, tenant_id: TenantId, user_id: UserId) -> Result<Option<Requester>>;
}

/// Directory backed by the application's `users` table.
#[derive(Clone)]
pub struct PgRequesterDirectory {
    pool: PgPool,
}

impl PgRequesterDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequesterDirectory for PgRequesterDirectory {
    async fn find(&self, tenant_id: TenantId, user_id: UserId) -> Result<Option<Requester>> {
        let row: Option<(Uuid, String, bool)> = sqlx::query_as(
            "SELECT id, role, is_active FROM users WHERE company_id = $1 AND id = $2",
        )
        .bind(tenant_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id, role, is_active)| -> Result<Requester> {
            Ok(Requester {
                id: UserId(id),
                tenant_id,
                role: role.parse()?,
                is_active,
            })
        })
        .transpose()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Audit
// ═══════════════════════════════════════════════════════════════════════════════

/// Audit actions emitted by the export runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "export.denied")]
    ExportDenied,
    #[serde(rename = "export.completed")]
    ExportCompleted,
    #[serde(rename = "export.failed")]
    ExportFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExportDenied => "export.denied",
            Self::ExportCompleted => "export.completed",
            Self::ExportFailed => "export.failed",
        }
    }
}

/// One audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub action: AuditAction,
    pub job_id: ExportJobId,
    pub details: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn export(
        action: AuditAction,
        tenant_id: TenantId,
        user_id: UserId,
        job_id: ExportJobId,
        job_type: ExportJobType,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            user_id: Some(user_id),
            action,
            job_id,
            details: serde_json::json!({ "export_type": job_type.as_str() }),
            at,
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Serialize) -> Self {
        if let (serde_json::Value::Object(map), Ok(v)) =
            (&mut self.details, serde_json::to_value(value))
        {
            map.insert(key.to_string(), v);
        }
        self
    }
}

/// Sink for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<()>;
}

/// Audit sink writing to the application's `audit_logs` table.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, company_id, user_id, action, entity_type, entity_id, details, created_at)
            VALUES ($1, $2, $3, $4, 'export_job', $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.tenant_id.0)
        .bind(event.user_id.map(|u| u.0))
        .bind(event.action.as_str())
        .bind(event.job_id.0)
        .bind(&event.details)
        .bind(event.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Audit sink that keeps events in memory.
#[derive(Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}
