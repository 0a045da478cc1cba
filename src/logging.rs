//! # Structured Logging Module
//!
//! Console logging for every environment, plus an optional JSON file sink for
//! following runs and jobs across async tasks.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use crate::config::LoggingConfig;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging from the logging configuration section.
///
/// `RUST_LOG` takes precedence over `config.level`. Safe to call repeatedly;
/// only the first call installs a subscriber.
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = || {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
        };

        let console = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(filter());

        let mut log_file = None;
        let file_layer = config.json_file_directory.as_ref().and_then(|dir| {
            let log_dir = PathBuf::from(dir);
            if let Err(e) = fs::create_dir_all(&log_dir) {
                eprintln!("log directory {} unavailable: {e}", log_dir.display());
                return None;
            }

            let file_name = format!(
                "hatchery.{}.{}.log",
                process::id(),
                Utc::now().format("%Y%m%d_%H%M%S")
            );
            log_file = Some(log_dir.join(&file_name));

            let appender = tracing_appender::rolling::never(&log_dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            // The worker thread must outlive the process-wide subscriber.
            std::mem::forget(guard);

            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(filter()),
            )
        });

        if tracing_subscriber::registry()
            .with(console)
            .with(file_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            level = %config.level,
            log_file = ?log_file,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Log structured data for workflow run operations
pub fn log_run_operation(
    operation: &str,
    run_id: Uuid,
    workflow_name: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        run_id = %run_id,
        workflow_name = workflow_name,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 RUN_OPERATION"
    );
}

/// Log a run job status change
pub fn log_job_transition(run_job_id: Uuid, job_id: &str, from: &str, to: &str, actor: Option<&str>) {
    tracing::info!(
        run_job_id = %run_job_id,
        job_id = %job_id,
        from = %from,
        to = %to,
        actor = actor,
        timestamp = %Utc::now().to_rfc3339(),
        "🔧 JOB_TRANSITION"
    );
}

/// Log queue activity by a hatchery
pub fn log_queue_event(event: &str, hatchery: &str, run_job_id: Option<Uuid>, details: Option<&str>) {
    tracing::info!(
        event = %event,
        hatchery = %hatchery,
        run_job_id = ?run_job_id,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📬 QUEUE_EVENT"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
