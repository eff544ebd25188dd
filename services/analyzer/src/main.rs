//! Argus Analyzer service
//!
//! Pulls the configured camera streams, detects events and writes alarm clips
//! to the upload directory, reporting each one to the admin service.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with ARGUS__)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::{Context, Result};
use argus_analyzer::config::{AnalyzerConfig, Control};
use argus_analyzer::detector::ConfiguredDetectors;
use argus_analyzer::encoder::gst::GstMuxerFactory;
use argus_analyzer::encoder::{AlarmVideoEncoder, EncoderParts};
use argus_analyzer::executor::ExecutorContext;
use argus_analyzer::logging::init_logging;
use argus_analyzer::notifier::{HttpNotifier, LogNotifier, Notifier};
use argus_analyzer::scheduler::{ControlStatus, Scheduler};
use argus_analyzer::transport::gst::GstTransport;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;

    init_logging(&config.logging);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        controls = config.controls.len(),
        "Starting analyzer service"
    );

    config.validate()?;

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let scheduler = Arc::new(build_scheduler(&config)?);

    // Opening a source blocks through its retries, one thread per control.
    // Detached: an add finishing after shutdown stops its own executor.
    for control in config.controls.clone() {
        spawn_add(scheduler.clone(), control);
    }

    shutdown_signal().await;
    info!("Initiating graceful shutdown...");

    let statuses = tokio::task::spawn_blocking(move || scheduler.shutdown())
        .await
        .context("Scheduler shutdown task failed")?;
    log_final_stats(&statuses);

    info!("Shutdown complete");
    Ok(())
}

fn spawn_add(scheduler: Arc<Scheduler>, control: Control) {
    let code = control.code.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("add-{}", code))
        .spawn(move || {
            let code = control.code.clone();
            match scheduler.add(control) {
                Ok(()) => info!(control = %code, "Control added"),
                Err(e) if e.is_lifecycle_misuse() => {
                    warn!(control = %code, error = %e, "Control not added")
                }
                Err(e) => error!(control = %code, error = %e, "Failed to add control"),
            }
        });

    if let Err(e) = spawned {
        error!(control = %code, error = %e, "Failed to spawn control startup thread");
    }
}

/// Load configuration, falling back to environment variables only.
fn load_config() -> Result<AnalyzerConfig> {
    let config = AnalyzerConfig::load().or_else(|e| {
        eprintln!("Failed to load config from files ({}), trying environment", e);
        AnalyzerConfig::from_env()
    })?;

    Ok(config)
}

fn build_scheduler(config: &AnalyzerConfig) -> Result<Scheduler> {
    let transport = GstTransport::new(config.source.clone())
        .context("Failed to initialize GStreamer transport")?;
    let muxers = GstMuxerFactory::new().context("Failed to initialize GStreamer muxer")?;

    let notifier: Arc<dyn Notifier> = match &config.alarm.admin_host {
        Some(host) => Arc::new(HttpNotifier::new(host, config.alarm.notify_timeout())),
        None => {
            warn!("No admin host configured, alarms will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let encoder = AlarmVideoEncoder::new(EncoderParts {
        upload_dir: config.alarm.upload_dir.clone(),
        file_name_format: config.alarm.file_name_format.clone(),
        settings: config.encoder.clone(),
        muxers: Arc::new(muxers),
        notifier,
    });

    let context = ExecutorContext::from_config(
        config,
        Arc::new(transport),
        Arc::new(ConfiguredDetectors),
        Arc::new(encoder),
    );

    Ok(Scheduler::new(context))
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(statuses: &[ControlStatus]) {
    info!("=== Final Statistics ===");

    for status in statuses {
        info!(
            control = %status.code,
            state = %status.state,
            frames_read = status.stats.frames_read,
            read_failures = status.stats.read_failures,
            triggers = status.stats.triggers,
            coalesced = status.stats.coalesced_triggers,
            alarms_encoded = status.stats.alarms_encoded,
            encode_failures = status.stats.encode_failures,
            relay_failures = status.stats.relay_failures,
            failure = ?status.failure,
            "Control final stats"
        );
    }
}
