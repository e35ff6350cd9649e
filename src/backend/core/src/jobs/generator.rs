//! Export content generation.
//!
//! Generators turn tenant data into CSV bytes. They own the row and byte
//! guardrails: [`CsvExport`] refuses to grow past `MAX_EXPORT_ROWS` or
//! `MAX_EXPORT_BYTES` and reports a [`ExportFailure::GuardrailExceeded`],
//! which the runner counts as a failed attempt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::{PgPool, Row};
use std::sync::Arc;

use super::{ExportFailure, ExportJobType, GuardrailKind, TenantId};
use crate::guardrails::GuardrailConfig;

/// Row and byte ceilings for one export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportLimits {
    pub max_rows: u64,
    pub max_bytes: u64,
}

impl From<&GuardrailConfig> for ExportLimits {
    fn from(g: &GuardrailConfig) -> Self {
        Self {
            max_rows: g.max_export_rows,
            max_bytes: g.max_export_bytes,
        }
    }
}

/// Finished export content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedContent {
    pub bytes: Vec<u8>,
    /// Data rows, header excluded
    pub rows: u64,
}

/// Produces the content of one export type for a tenant.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(
        &self,
        tenant_id: TenantId,
        params: &serde_json::Value,
        limits: ExportLimits,
    ) -> Result<GeneratedContent, ExportFailure>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Guarded CSV Writer
// ═══════════════════════════════════════════════════════════════════════════════

/// CSV buffer that enforces export guardrails as rows are appended.
pub struct CsvExport {
    writer: csv::Writer<Vec<u8>>,
    rows: u64,
    limits: ExportLimits,
}

impl CsvExport {
    /// Start an export with a header row.
    pub fn new(headers: &[&str], limits: ExportLimits) -> Result<Self, ExportFailure> {
        let mut export = Self {
            writer: csv::Writer::from_writer(Vec::new()),
            rows: 0,
            limits,
        };
        export.write(headers)?;
        Ok(export)
    }

    /// Append one data row.
    pub fn push_row<I, T>(&mut self, record: I) -> Result<(), ExportFailure>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        if self.rows >= self.limits.max_rows {
            return Err(ExportFailure::GuardrailExceeded {
                kind: GuardrailKind::Rows,
                limit: self.limits.max_rows,
            });
        }
        self.write(record)?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.writer.get_ref().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn finish(self) -> Result<GeneratedContent, ExportFailure> {
        let rows = self.rows;
        let bytes = self
            .writer
            .into_inner()
            .map_err(|e| ExportFailure::Generator(e.to_string()))?;
        Ok(GeneratedContent { bytes, rows })
    }

    fn write<I, T>(&mut self, record: I) -> Result<(), ExportFailure>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.writer
            .write_record(record)
            .and_then(|_| self.writer.flush().map_err(csv::Error::from))
            .map_err(|e| ExportFailure::Generator(e.to_string()))?;

        if self.len() > self.limits.max_bytes {
            return Err(ExportFailure::GuardrailExceeded {
                kind: GuardrailKind::Bytes,
                limit: self.limits.max_bytes,
            });
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// One generator per export type.
#[derive(Clone)]
pub struct ExportGenerators {
    sign_in_register: Arc<dyn ContentGenerator>,
    induction_responses: Arc<dyn ContentGenerator>,
    contractor_register: Arc<dyn ContentGenerator>,
    hazard_register: Arc<dyn ContentGenerator>,
    incident_register: Arc<dyn ContentGenerator>,
}

impl ExportGenerators {
    /// Build the registry by asking `make` for each export type.
    pub fn from_fn<F>(make: F) -> Self
    where
        F: Fn(ExportJobType) -> Arc<dyn ContentGenerator>,
    {
        Self {
            sign_in_register: make(ExportJobType::SignInRegister),
            induction_responses: make(ExportJobType::InductionResponses),
            contractor_register: make(ExportJobType::ContractorRegister),
            hazard_register: make(ExportJobType::HazardRegister),
            incident_register: make(ExportJobType::IncidentRegister),
        }
    }

    /// PostgreSQL generators for every type.
    pub fn postgres(pool: PgPool) -> Self {
        Self::from_fn(|job_type| Arc::new(PgCsvGenerator::new(pool.clone(), job_type)))
    }

    /// Replace the generator of one type.
    pub fn with(mut self, job_type: ExportJobType, generator: Arc<dyn ContentGenerator>) -> Self {
        *self.slot_mut(job_type) = generator;
        self
    }

    pub fn for_type(&self, job_type: ExportJobType) -> &dyn ContentGenerator {
        match job_type {
            ExportJobType::SignInRegister => self.sign_in_register.as_ref(),
            ExportJobType::InductionResponses => self.induction_responses.as_ref(),
            ExportJobType::ContractorRegister => self.contractor_register.as_ref(),
            ExportJobType::HazardRegister => self.hazard_register.as_ref(),
            ExportJobType::IncidentRegister => self.incident_register.as_ref(),
        }
    }

    fn slot_mut(&mut self, job_type: ExportJobType) -> &mut Arc<dyn ContentGenerator> {
        match job_type {
            ExportJobType::SignInRegister => &mut self.sign_in_register,
            ExportJobType::InductionResponses => &mut self.induction_responses,
            ExportJobType::ContractorRegister => &mut self.contractor_register,
            ExportJobType::HazardRegister => &mut self.hazard_register,
            ExportJobType::IncidentRegister => &mut self.incident_register,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PostgreSQL Generator
// ═══════════════════════════════════════════════════════════════════════════════

/// Header row and tenant-scoped query of an export type.
///
/// Every query selects text columns only, takes the tenant as `$1`, the row
/// cap as `$2` and an optional lower time bound as `$3`.
fn export_query(job_type: ExportJobType) -> (&'static [&'static str], &'static str) {
    match job_type {
        ExportJobType::SignInRegister => (
            &["site", "visitor", "company", "visitor_type", "signed_in", "signed_out"],
            r#"
            SELECT s.name, r.visitor_name, r.visitor_company, r.visitor_type,
                   r.sign_in_ts::text, r.sign_out_ts::text
            FROM sign_in_records r JOIN sites s ON s.id = r.site_id
            WHERE r.company_id = $1 AND ($3::timestamptz IS NULL OR r.sign_in_ts >= $3)
            ORDER BY r.sign_in_ts
            LIMIT $2
            "#,
        ),
        ExportJobType::InductionResponses => (
            &["site", "visitor", "template", "passed", "submitted"],
            r#"
            SELECT s.name, i.visitor_name, i.template_name, i.passed::text, i.submitted_at::text
            FROM induction_responses i JOIN sites s ON s.id = i.site_id
            WHERE i.company_id = $1 AND ($3::timestamptz IS NULL OR i.submitted_at >= $3)
            ORDER BY i.submitted_at
            LIMIT $2
            "#,
        ),
        ExportJobType::ContractorRegister => (
            &["contractor", "contact_email", "active", "documents", "created"],
            r#"
            SELECT c.name, c.contact_email, c.is_active::text,
                   (SELECT COUNT(*) FROM contractor_documents d WHERE d.contractor_id = c.id)::text,
                   c.created_at::text
            FROM contractors c
            WHERE c.company_id = $1 AND ($3::timestamptz IS NULL OR c.created_at >= $3)
            ORDER BY c.name
            LIMIT $2
            "#,
        ),
        ExportJobType::HazardRegister => (
            &["site", "hazard", "risk_level", "status", "raised"],
            r#"
            SELECT s.name, h.title, h.risk_level, h.status, h.created_at::text
            FROM hazards h JOIN sites s ON s.id = h.site_id
            WHERE h.company_id = $1 AND ($3::timestamptz IS NULL OR h.created_at >= $3)
            ORDER BY h.created_at
            LIMIT $2
            "#,
        ),
        ExportJobType::IncidentRegister => (
            &["site", "incident_type", "severity", "description", "occurred"],
            r#"
            SELECT s.name, i.incident_type, i.severity, i.description, i.occurred_at::text
            FROM incidents i JOIN sites s ON s.id = i.site_id
            WHERE i.company_id = $1 AND ($3::timestamptz IS NULL OR i.occurred_at >= $3)
            ORDER BY i.occurred_at
            LIMIT $2
            "#,
        ),
    }
}

/// Streams a tenant-scoped query into a guarded CSV buffer.
pub struct PgCsvGenerator {
    pool: PgPool,
    job_type: ExportJobType,
}

impl PgCsvGenerator {
    pub fn new(pool: PgPool, job_type: ExportJobType) -> Self {
        Self { pool, job_type }
    }
}

fn since_param(params: &serde_json::Value) -> Option<DateTime<Utc>> {
    params
        .get("since")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl ContentGenerator for PgCsvGenerator {
    async fn generate(
        &self,
        tenant_id: TenantId,
        params: &serde_json::Value,
        limits: ExportLimits,
    ) -> Result<GeneratedContent, ExportFailure> {
        let (headers, sql) = export_query(self.job_type);
        let mut export = CsvExport::new(headers, limits)?;

        // One extra row so the row guardrail can tell "exactly at" from "over".
        let fetch_limit = i64::try_from(limits.max_rows.saturating_add(1)).unwrap_or(i64::MAX);
        let mut rows = sqlx::query(sql)
            .bind(tenant_id.0)
            .bind(fetch_limit)
            .bind(since_param(params))
            .fetch(&self.pool);

        while let Some(row) = rows
            .try_next()
            .await
            .map_err(|e| ExportFailure::Generator(e.to_string()))?
        {
            let fields = (0..headers.len())
                .map(|i| row.try_get::<Option<String>, _>(i).map(Option::unwrap_or_default))
                .collect::<Result<Vec<String>, _>>()
                .map_err(|e| ExportFailure::Generator(e.to_string()))?;
            export.push_row(&fields)?;
        }

        tracing::debug!(
            tenant_id = %tenant_id,
            export_type = %self.job_type,
            rows = export.rows(),
            bytes = export.len(),
            "Export content generated"
        );
        export.finish()
    }
}
