//! # Structured Logging Module
//!
//! Environment-aware structured logging to the console and a JSON log file,
//! for following long-running command instances across stage waits.

use chrono::Utc;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; only the first call installs a subscriber.
/// If another global subscriber is already set it is left in place.
pub fn init_structured_logging() {
    LOGGER_GUARD.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let log_dir = PathBuf::from(
            std::env::var("SATCOM_BRIDGE_LOG_DIR").unwrap_or_else(|_| "log".to_string()),
        );
        let file_layer = match std::fs::create_dir_all(&log_dir) {
            Ok(()) => {
                let pid = process::id();
                let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
                let file_appender = tracing_appender::rolling::never(
                    &log_dir,
                    format!("{environment}.{pid}.{timestamp}.log"),
                );
                Some(tracing_appender::non_blocking(file_appender))
            }
            Err(_) => None,
        };

        let (file_writer, guard) = match file_layer {
            Some((writer, guard)) => (Some(writer), Some(guard)),
            None => (None, None),
        };

        let console = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(EnvFilter::new(log_level.clone()));

        let file = file_writer.map(|writer| {
            fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(EnvFilter::new(log_level))
        });

        if tracing_subscriber::registry()
            .with(console)
            .with(file)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            log_dir = %log_dir.display(),
            file_output = guard.is_some(),
            "🔧 STRUCTURED LOGGING: Initialized"
        );

        guard
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("SATCOM_BRIDGE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment, `RUST_LOG` wins when set
fn get_log_level(environment: &str) -> String {
    if let Ok(level) = std::env::var("RUST_LOG") {
        return level;
    }
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for orchestration instance operations
pub fn log_instance_operation(
    operation: &str,
    instance_id: Option<&str>,
    mobile_id: Option<&str>,
    stage: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        instance_id = instance_id,
        mobile_id = mobile_id,
        stage = stage,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🛰️ INSTANCE_OPERATION"
    );
}

/// Log structured data for shadow reconciliation
pub fn log_reconcile_operation(
    operation: &str,
    device_id: &str,
    property: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        device_id = %device_id,
        property = property,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔁 RECONCILE_OPERATION"
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
