//! Resource guardrails.
//!
//! Numeric and boolean operating limits read once from the process
//! environment at startup. The resulting [`GuardrailConfig`] is immutable and
//! is shared by the export runner and the retention reaper through an `Arc`.
//!
//! | Variable | Default |
//! |---|---|
//! | `MAX_EXPORT_ROWS` | 50000 |
//! | `MAX_EXPORT_BYTES` | 104857600 |
//! | `MAX_EXPORT_ATTEMPTS` | 3 |
//! | `MAX_EXPORT_RUNTIME_SECONDS` | 120 |
//! | `MAX_CONCURRENT_EXPORTS_GLOBAL` | 1 |
//! | `MAX_CONCURRENT_EXPORTS_PER_COMPANY` | 1 |
//! | `EXPORT_OFFPEAK_ONLY` | false |
//! | `EXPORTS_RETENTION_DAYS` | 30 |
//! | `AUDIT_RETENTION_DAYS` | 90 |
//! | `EXPORT_STALE_TIMEOUT_SECONDS` | 2 × runtime limit |
//! | `EXPORT_OFFPEAK_TIMEZONE` | UTC |
//! | `MAX_UPLOAD_BYTES` | 10485760 |
//! | `ALLOWED_UPLOAD_MIME_TYPES` | `application/pdf,image/jpeg,image/png` |
//! | `RETENTION_BATCH_SIZE` | 500 |
//! | `GUARDRAIL_TIER` | standard |

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;

/// Off-peak window starts at this local hour (inclusive).
pub const OFFPEAK_START_HOUR: u32 = 20;
/// Off-peak window ends at this local hour (exclusive).
pub const OFFPEAK_END_HOUR: u32 = 6;
/// Longest retention window in days; larger settings are clamped to it.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Parse an environment string as a positive integer, else `fallback`.
pub fn to_int(raw: Option<&str>, fallback: u64) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

/// Parse an environment string as a boolean.
///
/// Only `"true"` and `"1"` turn the flag on; anything else yields `fallback`.
pub fn to_bool(raw: Option<&str>, fallback: bool) -> bool {
    match raw.map(str::trim) {
        Some("true") | Some("1") => true,
        _ => fallback,
    }
}

/// Deployment sizing tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailTier {
    #[default]
    Standard,
    /// Small deployments sharing a database with interactive traffic.
    Constrained,
}

impl GuardrailTier {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("constrained") => Self::Constrained,
            _ => Self::Standard,
        }
    }

    /// Worker count for the reaper's bounded fan-out.
    pub fn retention_concurrency(&self) -> usize {
        match self {
            Self::Standard => 10,
            Self::Constrained => 2,
        }
    }
}

/// Process-lifetime resource limits.
#[derive(Debug, Clone)]
pub struct GuardrailConfig {
    pub max_export_rows: u64,
    pub max_export_bytes: u64,
    pub max_export_attempts: u32,
    pub max_export_runtime: StdDuration,
    pub max_concurrent_exports_global: u64,
    pub max_concurrent_exports_per_company: u64,
    pub export_offpeak_only: bool,
    pub exports_retention_days: u32,
    pub audit_retention_days: u32,
    /// RUNNING jobs older than this are presumed abandoned by a dead worker.
    pub export_stale_timeout: StdDuration,
    pub offpeak_timezone: Tz,
    pub max_upload_bytes: u64,
    /// Lower-cased allow-list.
    pub allowed_upload_mime_types: Vec<String>,
    pub retention_batch_size: u32,
    pub tier: GuardrailTier,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl GuardrailConfig {
    /// Read every guardrail from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve guardrails through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let int = |key: &str, fallback: u64| to_int(lookup(key).as_deref(), fallback);
        let days = |key: &str, fallback: u64| int(key, fallback).min(u64::from(MAX_RETENTION_DAYS)) as u32;

        let max_export_runtime_secs = int("MAX_EXPORT_RUNTIME_SECONDS", 120);
        let stale_secs = int("EXPORT_STALE_TIMEOUT_SECONDS", max_export_runtime_secs.saturating_mul(2));

        let offpeak_timezone = match lookup("EXPORT_OFFPEAK_TIMEZONE") {
            Some(name) => name.trim().parse::<Tz>().unwrap_or_else(|_| {
                tracing::warn!(timezone = %name, "Unknown off-peak time zone, using UTC");
                Tz::UTC
            }),
            None => Tz::UTC,
        };

        let allowed_upload_mime_types = lookup("ALLOWED_UPLOAD_MIME_TYPES")
            .unwrap_or_else(|| "application/pdf,image/jpeg,image/png".to_string())
            .split(',')
            .map(|m| m.trim().to_ascii_lowercase())
            .filter(|m| !m.is_empty())
            .collect();

        Self {
            max_export_rows: int("MAX_EXPORT_ROWS", 50_000),
            max_export_bytes: int("MAX_EXPORT_BYTES", 104_857_600),
            max_export_attempts: int("MAX_EXPORT_ATTEMPTS", 3).min(u32::MAX as u64) as u32,
            max_export_runtime: StdDuration::from_secs(max_export_runtime_secs),
            max_concurrent_exports_global: int("MAX_CONCURRENT_EXPORTS_GLOBAL", 1),
            max_concurrent_exports_per_company: int("MAX_CONCURRENT_EXPORTS_PER_COMPANY", 1),
            export_offpeak_only: to_bool(lookup("EXPORT_OFFPEAK_ONLY").as_deref(), false),
            exports_retention_days: days("EXPORTS_RETENTION_DAYS", 30),
            audit_retention_days: days("AUDIT_RETENTION_DAYS", 90),
            export_stale_timeout: StdDuration::from_secs(stale_secs),
            offpeak_timezone,
            max_upload_bytes: int("MAX_UPLOAD_BYTES", 10_485_760),
            allowed_upload_mime_types,
            retention_batch_size: int("RETENTION_BATCH_SIZE", 500).min(u32::MAX as u64) as u32,
            tier: GuardrailTier::parse(lookup("GUARDRAIL_TIER").as_deref()),
        }
    }

    /// Case-insensitive membership check against the upload allow-list.
    pub fn is_allowed_mime_type(&self, mime: &str) -> bool {
        let mime = mime.trim().to_ascii_lowercase();
        self.allowed_upload_mime_types.iter().any(|m| *m == mime)
    }

    /// Whether an upload of `size` bytes fits under `MAX_UPLOAD_BYTES`.
    pub fn is_allowed_upload_size(&self, size: u64) -> bool {
        size <= self.max_upload_bytes
    }

    /// Off-peak check in the configured zone.
    pub fn is_offpeak(&self, now: DateTime<Utc>) -> bool {
        is_offpeak_now(now, self.offpeak_timezone)
    }

    /// When a freshly completed export should be purged.
    pub fn export_expiry_date(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        retention_window(self.exports_retention_days)
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Cutoff before which audit log rows are purged.
    pub fn audit_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        retention_window(self.audit_retention_days)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// A retention window of `days`, clamped to [`MAX_RETENTION_DAYS`].
pub fn retention_window(days: u32) -> Option<Duration> {
    Duration::try_days(i64::from(days.min(MAX_RETENTION_DAYS)))
}

/// True inside the 20:00–06:00 local window, which wraps midnight.
pub fn is_offpeak_now(now: DateTime<Utc>, tz: Tz) -> bool {
    let hour = now.with_timezone(&tz).hour();
    hour >= OFFPEAK_START_HOUR || hour < OFFPEAK_END_HOUR
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_to_int() {
        assert_eq!(to_int(Some("42"), 7), 42);
        assert_eq!(to_int(Some(" 42 "), 7), 42);
        assert_eq!(to_int(Some("0"), 7), 7);
        assert_eq!(to_int(Some("-3"), 7), 7);
        assert_eq!(to_int(Some("abc"), 7), 7);
        assert_eq!(to_int(None, 7), 7);
    }

    #[test]
    fn test_to_bool() {
        assert!(to_bool(Some("true"), false));
        assert!(to_bool(Some("1"), false));
        assert!(!to_bool(Some("yes"), false));
        assert!(to_bool(Some("false"), true));
        assert!(to_bool(None, true));
    }

    #[test]
    fn test_defaults() {
        let g = GuardrailConfig::default();
        assert_eq!(g.max_export_rows, 50_000);
        assert_eq!(g.max_export_bytes, 104_857_600);
        assert_eq!(g.max_export_attempts, 3);
        assert_eq!(g.max_export_runtime, StdDuration::from_secs(120));
        assert_eq!(g.max_concurrent_exports_global, 1);
        assert_eq!(g.max_concurrent_exports_per_company, 1);
        assert!(!g.export_offpeak_only);
        assert_eq!(g.exports_retention_days, 30);
        assert_eq!(g.audit_retention_days, 90);
        assert_eq!(g.export_stale_timeout, StdDuration::from_secs(240));
        assert_eq!(g.offpeak_timezone, Tz::UTC);
        assert_eq!(g.tier, GuardrailTier::Standard);
        assert_eq!(g.tier.retention_concurrency(), 10);
    }

    #[test]
    fn test_overrides() {
        let g = GuardrailConfig::from_lookup(lookup_from(&[
            ("MAX_EXPORT_RUNTIME_SECONDS", "30"),
            ("EXPORT_OFFPEAK_ONLY", "1"),
            ("EXPORT_OFFPEAK_TIMEZONE", "Pacific/Auckland"),
            ("GUARDRAIL_TIER", "Constrained"),
        ]));
        assert_eq!(g.max_export_runtime, StdDuration::from_secs(30));
        assert_eq!(g.export_stale_timeout, StdDuration::from_secs(60));
        assert!(g.export_offpeak_only);
        assert_eq!(g.offpeak_timezone, chrono_tz::Pacific::Auckland);
        assert_eq!(g.tier.retention_concurrency(), 2);
    }

    #[test]
    fn test_unknown_timezone_falls_back_to_utc() {
        let g = GuardrailConfig::from_lookup(lookup_from(&[("EXPORT_OFFPEAK_TIMEZONE", "Mars/Base")]));
        assert_eq!(g.offpeak_timezone, Tz::UTC);
    }

    #[test]
    fn test_mime_types_case_insensitive() {
        let g = GuardrailConfig::default();
        assert!(g.is_allowed_mime_type("application/pdf"));
        assert!(g.is_allowed_mime_type("IMAGE/JPEG"));
        assert!(!g.is_allowed_mime_type("text/html"));
        assert!(g.is_allowed_upload_size(10_485_760));
        assert!(!g.is_allowed_upload_size(10_485_761));
    }

    #[test]
    fn test_offpeak_wraps_midnight() {
        let at = |h, m| Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap();
        assert!(is_offpeak_now(at(20, 0), Tz::UTC));
        assert!(is_offpeak_now(at(23, 59), Tz::UTC));
        assert!(is_offpeak_now(at(0, 0), Tz::UTC));
        assert!(is_offpeak_now(at(5, 59), Tz::UTC));
        assert!(!is_offpeak_now(at(6, 0), Tz::UTC));
        assert!(!is_offpeak_now(at(19, 59), Tz::UTC));
    }

    #[test]
    fn test_offpeak_uses_local_hour() {
        // 08:00 UTC is 21:00 in Auckland during NZDT.
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap();
        assert!(!is_offpeak_now(now, Tz::UTC));
        assert!(is_offpeak_now(now, chrono_tz::Pacific::Auckland));
    }

    #[test]
    fn test_export_expiry_date() {
        let g = GuardrailConfig::default();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            g.export_expiry_date(now),
            Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap()
        );
        assert_eq!(
            g.audit_cutoff(now),
            Utc.with_ymd_and_hms(2023, 12, 2, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_huge_settings_are_clamped() {
        let g = GuardrailConfig::from_lookup(lookup_from(&[
            ("EXPORTS_RETENTION_DAYS", "200000000"),
            ("AUDIT_RETENTION_DAYS", "200000000"),
            ("MAX_EXPORT_RUNTIME_SECONDS", "18446744073709551615"),
        ]));
        assert_eq!(g.exports_retention_days, MAX_RETENTION_DAYS);
        assert_eq!(g.audit_retention_days, MAX_RETENTION_DAYS);
        assert_eq!(g.export_stale_timeout, StdDuration::from_secs(u64::MAX));

        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let window = Duration::days(i64::from(MAX_RETENTION_DAYS));
        assert_eq!(g.export_expiry_date(now), now + window);
        assert_eq!(g.audit_cutoff(now), now - window);
    }

    #[test]
    fn test_date_helpers_never_overflow() {
        let g = GuardrailConfig {
            exports_retention_days: u32::MAX,
            audit_retention_days: u32::MAX,
            ..GuardrailConfig::default()
        };
        let window = Duration::days(i64::from(MAX_RETENTION_DAYS));
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(g.export_expiry_date(now), now + window);
        assert_eq!(g.audit_cutoff(now), now - window);

        assert_eq!(g.export_expiry_date(DateTime::<Utc>::MAX_UTC), DateTime::<Utc>::MAX_UTC);
        assert_eq!(g.audit_cutoff(DateTime::<Utc>::MIN_UTC), DateTime::<Utc>::MIN_UTC);
    }
}
