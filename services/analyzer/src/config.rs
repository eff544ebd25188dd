//! Configuration management for the analyzer service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files, including the list of controls to start.

use crate::detector::DetectorConfig;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the analyzer service.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    /// Service identity and metrics
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Stream source configuration shared by all controls
    #[serde(default)]
    pub source: SourceConfig,

    /// Alarm capture and reporting configuration
    pub alarm: AlarmConfig,

    /// Alarm clip encoder configuration
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Controls started at boot
    #[serde(default)]
    pub controls: Vec<Control>,
}

/// Service identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name reported in logs
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Port for the Prometheus exporter; disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

/// Stream source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Attempts to open a source before the control fails to start
    #[serde(default = "default_max_open_attempts")]
    pub max_open_attempts: u32,

    /// Base delay between open attempts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay between open attempts in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Consecutive failed reads tolerated before the control stops
    #[serde(default = "default_max_read_retries")]
    pub max_read_retries: u32,

    /// Pause between failed reads in milliseconds
    #[serde(default = "default_read_retry_delay_ms")]
    pub read_retry_delay_ms: u64,

    /// How long a single read waits for a decoded frame in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Pipeline state change timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// RTSP transport protocol (tcp, udp, or udp-mcast)
    #[serde(default = "default_transport")]
    pub transport: String,

    /// RTSP jitter buffer in milliseconds
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u32,
}

/// How completed alarms are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeMode {
    /// Encode on the control's decode thread
    #[default]
    Inline,
    /// Encode on a dedicated per-control worker thread
    Worker,
}

/// Alarm capture and reporting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AlarmConfig {
    /// Directory alarm clips and snapshots are written to
    pub upload_dir: PathBuf,

    /// chrono format string for artifact file names
    #[serde(default = "default_file_name_format")]
    pub file_name_format: String,

    /// Seconds of video kept before a trigger
    #[serde(default = "default_pre_alarm_secs")]
    pub pre_alarm_secs: u32,

    /// Seconds of video captured after a trigger
    #[serde(default = "default_post_alarm_secs")]
    pub post_alarm_secs: u32,

    /// Inline or worker encoding
    #[serde(default)]
    pub encode_mode: EncodeMode,

    /// Admin host receiving alarm notifications, e.g. "http://admin:9001"
    #[serde(default)]
    pub admin_host: Option<String>,

    /// Notification request timeout in seconds
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout_secs: u64,
}

/// Alarm clip encoder configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    /// Target bitrate in bits per second
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,

    /// H.264 profile
    #[serde(default = "default_profile")]
    pub profile: String,

    /// x264 speed preset
    #[serde(default = "default_preset")]
    pub preset: String,

    /// Maximum consecutive B-frames
    #[serde(default = "default_max_b_frames")]
    pub max_b_frames: u32,
}

/// One monitored stream.
#[derive(Debug, Clone, Deserialize)]
pub struct Control {
    /// Unique control code
    pub code: String,

    /// Source stream URL (e.g., "rtsp://camera:554/stream")
    pub stream_url: String,

    /// Optional URL frames are relayed to live
    #[serde(default)]
    pub push_url: Option<String>,

    /// Detection backend for this control
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Minimum detection score that raises an alarm
    #[serde(default = "default_min_score")]
    pub min_score: f32,

    /// Output overrides; unset fields follow the source stream
    #[serde(default)]
    pub output: OutputParams,
}

/// Codec and output parameters of a control.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputParams {
    #[serde(default)]
    pub fps: Option<u32>,

    #[serde(default)]
    pub width: Option<u32>,

    #[serde(default)]
    pub height: Option<u32>,

    /// Bitrate baseline in bits per second
    #[serde(default)]
    pub bitrate: Option<u32>,
}

// Default value functions
fn default_service_name() -> String {
    "argus-analyzer".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_max_open_attempts() -> u32 {
    3
}
fn default_reconnect_base_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30000
}
fn default_max_read_retries() -> u32 {
    10
}
fn default_read_retry_delay_ms() -> u64 {
    100
}
fn default_read_timeout_ms() -> u64 {
    5000
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_transport() -> String {
    "tcp".to_string()
}
fn default_latency_ms() -> u32 {
    200
}
fn default_file_name_format() -> String {
    "%Y%m%d%H%M%S%3f".to_string()
}
fn default_pre_alarm_secs() -> u32 {
    2
}
fn default_post_alarm_secs() -> u32 {
    3
}
fn default_notify_timeout() -> u64 {
    5
}
fn default_bitrate() -> u32 {
    100_000
}
fn default_profile() -> String {
    "main".to_string()
}
fn default_preset() -> String {
    "superfast".to_string()
}
fn default_max_b_frames() -> u32 {
    5
}
fn default_min_score() -> f32 {
    0.5
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            max_open_attempts: default_max_open_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_read_retries: default_max_read_retries(),
            read_retry_delay_ms: default_read_retry_delay_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            connection_timeout_secs: default_connection_timeout(),
            transport: default_transport(),
            latency_ms: default_latency_ms(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            bitrate: default_bitrate(),
            profile: default_profile(),
            preset: default_preset(),
            max_b_frames: default_max_b_frames(),
        }
    }
}

impl AnalyzerConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with ARGUS_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Override with environment variables (e.g., ARGUS__ALARM__UPLOAD_DIR)
            .add_source(
                Environment::with_prefix("ARGUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("ARGUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.alarm.upload_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "alarm.upload_dir".to_string(),
            ));
        }

        if self.alarm.file_name_format.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "alarm.file_name_format".to_string(),
            ));
        }

        if let Some(host) = &self.alarm.admin_host {
            if !host.starts_with("http://") && !host.starts_with("https://") {
                return Err(ConfigValidationError::InvalidValue {
                    field: "alarm.admin_host".to_string(),
                    message: "Host must start with http:// or https://".to_string(),
                });
            }
        }

        if self.encoder.bitrate == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "encoder.bitrate".to_string(),
                message: "Bitrate must be greater than 0".to_string(),
            });
        }

        if self.source.max_open_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "source.max_open_attempts".to_string(),
                message: "At least one open attempt is required".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for control in &self.controls {
            control.validate()?;
            if !seen.insert(control.code.as_str()) {
                return Err(ConfigValidationError::InvalidValue {
                    field: "controls".to_string(),
                    message: format!("Duplicate control code: {}", control.code),
                });
            }
        }

        Ok(())
    }
}

impl SourceConfig {
    /// Get base reconnection delay as Duration.
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Get maximum reconnection delay as Duration.
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }
}

impl AlarmConfig {
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }
}

impl Control {
    /// A control with default detection and output settings.
    pub fn new(code: impl Into<String>, stream_url: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            stream_url: stream_url.into(),
            push_url: None,
            detector: DetectorConfig::default(),
            min_score: default_min_score(),
            output: OutputParams::default(),
        }
    }

    /// Validate a single control descriptor.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.code.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("control.code".to_string()));
        }

        if self.stream_url.is_empty() {
            return Err(ConfigValidationError::MissingField(format!(
                "controls[{}].stream_url",
                self.code
            )));
        }
        if !self.stream_url.contains("://") {
            return Err(ConfigValidationError::InvalidValue {
                field: format!("controls[{}].stream_url", self.code),
                message: "URL must include a scheme".to_string(),
            });
        }

        if let Some(push_url) = &self.push_url {
            if !push_url.contains("://") {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("controls[{}].push_url", self.code),
                    message: "URL must include a scheme".to_string(),
                });
            }
        }

        if !(0.0..=1.0).contains(&self.min_score) {
            return Err(ConfigValidationError::InvalidValue {
                field: format!("controls[{}].min_score", self.code),
                message: "Score threshold must be within 0.0..=1.0".to_string(),
            });
        }

        if matches!(self.output.fps, Some(0))
            || matches!(self.output.width, Some(0))
            || matches!(self.output.height, Some(0))
        {
            return Err(ConfigValidationError::InvalidValue {
                field: format!("controls[{}].output", self.code),
                message: "Output fps and dimensions must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
