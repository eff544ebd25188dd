//! Process-wide tracing setup.

use crate::config::LoggingConfig;
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: OnceLock<bool> = OnceLock::new();

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Build the filter: `RUST_LOG` first, then the configured level for this
/// crate, with GStreamer kept quiet.
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    let level = parse_level(&config.level);
    let mut filter = EnvFilter::from_default_env();

    for directive in [format!("argus_analyzer={}", level), "gstreamer=warn".to_string()] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Install the global subscriber.
///
/// Only the first call installs anything; later calls return whether that
/// first installation succeeded. Safe to call from tests and the binary alike.
pub fn init_logging(config: &LoggingConfig) -> bool {
    *INIT.get_or_init(|| {
        let registry = tracing_subscriber::registry().with(build_filter(config));

        let result = if config.format == "json" {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_file(config.include_location)
                        .with_line_number(config.include_location),
                )
                .try_init()
        } else {
            registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_file(config.include_location)
                        .with_line_number(config.include_location),
                )
                .try_init()
        };

        result.is_ok()
    })
}
