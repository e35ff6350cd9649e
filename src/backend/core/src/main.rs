//! Sitegate Worker - Main entry point
//!
//! Runs the export runner and the retention reaper against the shared
//! PostgreSQL database until SIGINT/SIGTERM.

use std::sync::Arc;

use clap::Parser;

use sitegate_core::{
    config::Config,
    db::Database,
    guardrails::GuardrailConfig,
    jobs::{
        ExportGenerators, ExportRunner, ExportScheduler, PgAuditSink, PgJobStore,
        PgRequesterDirectory, ScheduleOptions,
    },
    retention::{PgRetentionStore, RetentionReaper, RetentionScheduler},
    storage::build_storage,
    telemetry::init_telemetry,
};

#[derive(Parser, Debug)]
#[command(
    name = "sitegate-worker",
    version,
    about = "Export runner and retention reaper for Sitegate tenants"
)]
struct Cli {
    /// Configuration file, layered under SITEGATE__* environment variables
    #[arg(short, long, env = "SITEGATE_CONFIG")]
    config: Option<String>,

    /// Process one export job and run one retention sweep, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    let telemetry = init_telemetry(&config.observability)?;

    let guardrails = Arc::new(GuardrailConfig::from_env());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        tier = ?guardrails.tier,
        max_concurrent_exports_global = guardrails.max_concurrent_exports_global,
        max_concurrent_exports_per_company = guardrails.max_concurrent_exports_per_company,
        export_offpeak_only = guardrails.export_offpeak_only,
        "Starting Sitegate worker"
    );

    let db = Database::new(&config.database).await?;
    if config.database.run_migrations {
        db.migrate().await?;
    }
    db.ping().await?;

    let storage = build_storage(&config.storage)?;
    let pool = db.pool().clone();

    let runner = Arc::new(ExportRunner::new(
        Arc::new(PgJobStore::new(pool.clone())),
        Arc::new(PgRequesterDirectory::new(pool.clone())),
        Arc::new(PgAuditSink::new(pool.clone())),
        ExportGenerators::postgres(pool.clone()),
        storage.clone(),
        guardrails.clone(),
    ));
    let reaper = Arc::new(RetentionReaper::new(
        Arc::new(PgRetentionStore::new(pool)),
        storage,
        guardrails,
    ));

    if cli.once {
        let processed = runner.process_next_export_job().await;
        let report = reaper.sweep().await;
        tracing::info!(
            processed = ?processed.map(|job| job.outcome),
            deleted = report.total_deleted(),
            failures = report.failures,
            "Single pass complete"
        );
        telemetry.shutdown();
        return Ok(());
    }

    let exports = ExportScheduler::new(
        runner,
        ScheduleOptions::every(config.worker.export_poll_interval()).with_immediate(),
    );
    let mut retention_options = ScheduleOptions::every(config.worker.retention_interval());
    if config.worker.run_retention_on_start {
        retention_options = retention_options.with_immediate();
    }
    let retention = RetentionScheduler::new(reaper, retention_options);

    exports.start();
    retention.start();
    tracing::info!(
        export_interval_secs = config.worker.export_poll_interval().as_secs(),
        retention_interval_secs = config.worker.retention_interval().as_secs(),
        "Workers started"
    );

    shutdown_signal().await;

    // Let in-flight ticks finish before the runtime is dropped
    exports.stop();
    retention.stop();
    tokio::join!(exports.shutdown(), retention.shutdown());
    telemetry.shutdown();
    tracing::info!("Worker shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
