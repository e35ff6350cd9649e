//! Prometheus metrics for the export runner and retention reaper.
//!
//! Metric names recorded by the worker:
//!
//! | Name | Kind | Labels |
//! |---|---|---|
//! | `sitegate_export_jobs_total` | counter | `outcome` |
//! | `sitegate_export_duration_seconds` | histogram | |
//! | `sitegate_export_bytes_total` | counter | |
//! | `sitegate_stale_jobs_requeued_total` | counter | |
//! | `sitegate_retention_deleted_total` | counter | `target` |
//! | `sitegate_retention_failures_total` | counter | `target` |
//! | `sitegate_errors_total` | counter | `code`, `category` |

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address of the Prometheus scrape listener (e.g. "0.0.0.0:9090");
    /// without one the recorder is installed and rendered on demand
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: Option<String>,

    /// Histogram buckets for export durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            endpoint: default_metrics_endpoint(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_endpoint() -> Option<String> {
    Some("0.0.0.0:9090".to_string())
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
}

/// Handle to the installed recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// Render all metrics in Prometheus text format.
    ///
    /// Empty when metrics are disabled or served by the HTTP listener.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder.
///
/// With an `endpoint` configured this starts the scrape listener on the
/// current tokio runtime.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry {
            prometheus_handle: None,
        });
    }

    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let prometheus_handle = match &config.endpoint {
        Some(endpoint) => {
            let addr: SocketAddr = endpoint.parse()?;
            builder.with_http_listener(addr).install()?;
            None
        }
        None => Some(builder.install_recorder()?),
    };

    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        endpoint = ?config.endpoint,
        "Metrics initialized"
    );

    Ok(MetricsRegistry { prometheus_handle })
}

fn register_metric_descriptions() {
    describe_counter!(
        "sitegate_export_jobs_total",
        "Export jobs processed by outcome"
    );
    describe_histogram!(
        "sitegate_export_duration_seconds",
        Unit::Seconds,
        "Wall-clock time spent generating export content"
    );
    describe_counter!(
        "sitegate_export_bytes_total",
        Unit::Bytes,
        "Bytes of export artifacts written to storage"
    );
    describe_counter!(
        "sitegate_stale_jobs_requeued_total",
        "RUNNING export jobs returned to the queue after the stale timeout"
    );
    describe_counter!(
        "sitegate_retention_deleted_total",
        "Records removed by the retention reaper by target"
    );
    describe_counter!(
        "sitegate_retention_failures_total",
        "Retention targets or items that failed to purge"
    );
    describe_counter!(
        "sitegate_errors_total",
        "Errors raised by error code and category"
    );
}
