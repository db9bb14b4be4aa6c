//! Structured logging for the governance core
//!
//! This module provides structured logging using the `tracing` crate with
//! support for console output and non-blocking file logging.

use crate::config::{GovernanceConfig, LogFormat, LogLevel, LoggingConfig};
use crate::resource::ResourceKind;
use std::path::Path;
use std::sync::{Once, OnceLock};
use std::time::Duration;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{format::FmtSpan, time::UtcTime, writer::BoxMakeWriter};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the logging system based on configuration.
///
/// Only the first call installs a subscriber; later calls are no-ops.
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = init_logging_inner(config);
    });
    result
}

fn init_logging_inner(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let level = convert_log_level(&config.level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_ascii_lowercase()));

    let writer = match &config.file_path {
        Some(file_path) => {
            let path = Path::new(file_path);
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| format!("invalid log file path: {}", file_path))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            BoxMakeWriter::new(non_blocking)
        }
        None if config.console => BoxMakeWriter::new(std::io::stdout),
        None => BoxMakeWriter::new(std::io::sink),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(config.structured)
        .with_thread_ids(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(UtcTime::rfc_3339());

    match config.format {
        LogFormat::Json => builder.json().try_init().map_err(|e| e as Box<dyn std::error::Error>)?,
        LogFormat::Pretty => builder.pretty().try_init().map_err(|e| e as Box<dyn std::error::Error>)?,
        LogFormat::Simple => builder.try_init().map_err(|e| e as Box<dyn std::error::Error>)?,
    }

    tracing::info!("Logging system initialized with level: {:?}", config.level);
    Ok(())
}

/// Convert our log level to tracing level
fn convert_log_level(level: &LogLevel) -> Level {
    match level {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

/// Log a resource manager operation with structured fields
pub fn log_resource_operation(
    operation: &str,
    resource_id: &str,
    kind: ResourceKind,
    success: bool,
    duration: Duration,
) {
    let span = tracing::debug_span!(
        "resource_operation",
        operation = operation,
        resource_id = resource_id,
        kind = kind.as_str(),
        success = success,
        duration_us = duration.as_micros() as u64,
    );
    let _enter = span.enter();

    if success {
        tracing::debug!("Resource operation completed");
    } else {
        tracing::warn!("Resource operation failed");
    }
}

/// Log a two-phase commit operation with structured fields
pub fn log_transaction_operation(
    operation: &str,
    transaction_id: &str,
    success: bool,
    duration: Duration,
    additional_fields: Option<Vec<(&str, String)>>,
) {
    let details = additional_fields
        .unwrap_or_default()
        .into_iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(" ");

    let span = tracing::info_span!(
        "transaction_operation",
        operation = operation,
        transaction_id = transaction_id,
        success = success,
        duration_ms = duration.as_millis() as u64,
    );
    let _enter = span.enter();

    if success {
        tracing::info!(details = %details, "Transaction operation completed");
    } else {
        tracing::warn!(details = %details, "Transaction operation failed");
    }
}

/// Log a leader election operation with structured fields
pub fn log_election_operation(operation: &str, election_key: &str, node_id: &str, success: bool) {
    let span = tracing::info_span!(
        "election_operation",
        operation = operation,
        election_key = election_key,
        node_id = node_id,
        success = success,
    );
    let _enter = span.enter();

    if success {
        tracing::info!("Election operation succeeded");
    } else {
        tracing::info!("Election operation did not succeed");
    }
}

/// Log system startup
pub fn log_startup(config: &GovernanceConfig) {
    tracing::info!("Starting governance node: {}", config.node.node_id);
    tracing::info!(
        "Resource limits: memory={}MB connections={} file_handles={} sockets={} threads={}",
        config.resources.memory_limit_mb,
        config.resources.max_connections,
        config.resources.max_file_handles,
        config.resources.max_sockets,
        config.resources.max_threads,
    );
    tracing::info!(
        "Reclamation: interval={}s idle_timeout={}s",
        config.resources.cleanup_interval,
        config.resources.idle_timeout,
    );

    if config.node.run_for_leader {
        tracing::info!(
            "Leader election enabled: key={} lease_ttl={}s",
            config.node.election_key,
            config.election.lease_ttl
        );
    }

    if config.metrics.enabled && config.metrics.prometheus {
        tracing::info!("Metrics enabled: {}:{}", config.metrics.bind_address, config.metrics.port);
    }
}

/// Log system shutdown
pub fn log_shutdown(reason: &str) {
    tracing::info!("Shutting down governance node: {}", reason);
}
