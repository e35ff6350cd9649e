//! Export job definitions.
//!
//! This module provides the core types of the export queue:
//!
//! - **ExportJob**: A persisted request to build one tenant export
//! - **ExportJobStatus**: QUEUED → RUNNING → {SUCCEEDED | QUEUED | FAILED}
//! - **ExportJobType**: The closed set of export kinds
//! - **ExportFailure**: Failures that count as an attempt
//! - **retry_delay**: Exponential backoff between counted attempts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ErrorCode, SitegateError};

// ═══════════════════════════════════════════════════════════════════════════════
// Identification
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for an export job.
    ExportJobId
);
uuid_id!(
    /// Tenant (company) identifier; the isolation boundary for all job data.
    TenantId
);
uuid_id!(
    /// Identifier of an application user.
    UserId
);

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of an export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportJobStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed by a worker
    Running,
    /// Artifact stored
    Succeeded,
    /// Terminal failure
    Failed,
}

impl ExportJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    /// Check if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ExportJobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Queued)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for ExportJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportJobStatus {
    type Err = SitegateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            other => Err(SitegateError::new(
                ErrorCode::DeserializationError,
                format!("unknown export status: {}", other),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The kinds of export a tenant can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportJobType {
    /// Site sign-in / sign-out register
    SignInRegister,
    /// Induction form responses
    InductionResponses,
    /// Contractor companies and their documents
    ContractorRegister,
    /// Site hazard register
    HazardRegister,
    /// Incident reports
    IncidentRegister,
}

impl ExportJobType {
    pub const ALL: [ExportJobType; 5] = [
        Self::SignInRegister,
        Self::InductionResponses,
        Self::ContractorRegister,
        Self::HazardRegister,
        Self::IncidentRegister,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignInRegister => "SIGN_IN_REGISTER",
            Self::InductionResponses => "INDUCTION_RESPONSES",
            Self::ContractorRegister => "CONTRACTOR_REGISTER",
            Self::HazardRegister => "HAZARD_REGISTER",
            Self::IncidentRegister => "INCIDENT_REGISTER",
        }
    }

    /// Filename stem of the generated artifact.
    pub fn file_stem(&self) -> &'static str {
        match self {
            Self::SignInRegister => "sign-in-register",
            Self::InductionResponses => "induction-responses",
            Self::ContractorRegister => "contractor-register",
            Self::HazardRegister => "hazard-register",
            Self::IncidentRegister => "incident-register",
        }
    }

    /// Artifact filename for a given job.
    pub fn file_name(&self, id: ExportJobId) -> String {
        format!("{}-{}.csv", self.file_stem(), id)
    }
}

impl fmt::Display for ExportJobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportJobType {
    type Err = SitegateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                SitegateError::new(
                    ErrorCode::UnknownExportType,
                    format!("unknown export type: {}", s),
                )
            })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Export Job
// ═══════════════════════════════════════════════════════════════════════════════

/// Metadata of a stored export artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFile {
    pub path: String,
    pub name: String,
    pub size: u64,
}

/// A persisted export request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: ExportJobId,
    pub tenant_id: TenantId,
    pub job_type: ExportJobType,
    pub status: ExportJobStatus,
    pub requested_by: UserId,
    /// Counted failures so far
    pub attempts: u32,
    /// Opaque generator parameters (date range, site filter)
    pub params: serde_json::Value,
    pub queued_at: DateTime<Utc>,
    /// Not claimable before this instant
    pub available_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub file: Option<ExportFile>,
    pub error_message: Option<String>,
}

impl ExportJob {
    /// A freshly enqueued job.
    pub fn new(tenant_id: TenantId, job_type: ExportJobType, requested_by: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: ExportJobId::new(),
            tenant_id,
            job_type,
            status: ExportJobStatus::Queued,
            requested_by,
            attempts: 0,
            params: serde_json::Value::Null,
            queued_at: now,
            available_at: now,
            started_at: None,
            completed_at: None,
            expires_at: None,
            file: None,
            error_message: None,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn queued_at(mut self, at: DateTime<Utc>) -> Self {
        self.queued_at = at;
        self.available_at = at;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Outcomes and Failures
// ═══════════════════════════════════════════════════════════════════════════════

/// Which guardrail stopped an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailKind {
    Rows,
    Bytes,
    Runtime,
}

impl fmt::Display for GuardrailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rows => f.write_str("rows"),
            Self::Bytes => f.write_str("bytes"),
            Self::Runtime => f.write_str("runtime"),
        }
    }
}

/// A failure that counts as an attempt.
#[derive(Debug, thiserror::Error)]
pub enum ExportFailure {
    #[error("export guardrail exceeded: {kind} limit {limit}")]
    GuardrailExceeded { kind: GuardrailKind, limit: u64 },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("generator failure: {0}")]
    Generator(String),

    #[error("requester lookup failed: {0}")]
    Lookup(String),
}

impl ExportFailure {
    pub fn is_guardrail(&self) -> bool {
        matches!(self, Self::GuardrailExceeded { .. })
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::GuardrailExceeded { kind: GuardrailKind::Rows, .. } => ErrorCode::RowLimitExceeded,
            Self::GuardrailExceeded { kind: GuardrailKind::Bytes, .. } => ErrorCode::ByteLimitExceeded,
            Self::GuardrailExceeded { kind: GuardrailKind::Runtime, .. } => {
                ErrorCode::RuntimeLimitExceeded
            }
            Self::Storage(_) => ErrorCode::StorageWriteFailed,
            Self::Generator(_) => ErrorCode::InternalError,
            Self::Lookup(_) => ErrorCode::DatabaseQueryFailed,
        }
    }
}

/// Why a claimed job was put back without counting an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    TenantConcurrency,
    GlobalConcurrency,
    OutsideOffPeak,
}

impl DeferReason {
    /// Requeue delay for this skip.
    pub fn delay(&self) -> Duration {
        match self {
            Self::TenantConcurrency | Self::GlobalConcurrency => TRANSIENT_SKIP_DELAY,
            Self::OutsideOffPeak => OFFPEAK_SKIP_DELAY,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TenantConcurrency => "tenant_concurrency",
            Self::GlobalConcurrency => "global_concurrency",
            Self::OutsideOffPeak => "outside_offpeak",
        }
    }
}

/// What the runner did with the job it claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// Requester missing, inactive, or lacking permission
    Denied,
    /// Transient skip, not a counted attempt
    Deferred(DeferReason),
    /// Counted failure below the ceiling
    Retrying { attempts: u32, delay: Duration },
    /// Attempts exhausted
    Failed { attempts: u32 },
}

impl JobOutcome {
    /// Status the job was left in.
    pub fn status(&self) -> ExportJobStatus {
        match self {
            Self::Succeeded => ExportJobStatus::Succeeded,
            Self::Denied | Self::Failed { .. } => ExportJobStatus::Failed,
            Self::Deferred(_) | Self::Retrying { .. } => ExportJobStatus::Queued,
        }
    }

    /// Label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Denied => "denied",
            Self::Deferred(_) => "deferred",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
        }
    }
}

/// The job a single runner invocation touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedJob {
    pub id: ExportJobId,
    pub tenant_id: TenantId,
    pub status: ExportJobStatus,
    pub outcome: JobOutcome,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// Requeue delay after a concurrency skip.
pub const TRANSIENT_SKIP_DELAY: Duration = Duration::from_secs(30);
/// Requeue delay when waiting for the off-peak window.
pub const OFFPEAK_SKIP_DELAY: Duration = Duration::from_secs(60 * 60);
/// Base of the exponential retry backoff.
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;
/// Upper bound of the retry backoff.
pub const RETRY_MAX_DELAY_MS: u64 = 300_000;

/// Backoff before the next attempt: `min(300s, 2^attempts * 1s)`.
pub fn retry_delay(attempts: u32) -> Duration {
    let ms = 2u64
        .checked_pow(attempts)
        .and_then(|factor| factor.checked_mul(RETRY_BASE_DELAY_MS))
        .unwrap_or(u64::MAX)
        .min(RETRY_MAX_DELAY_MS);
    Duration::from_millis(ms)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
