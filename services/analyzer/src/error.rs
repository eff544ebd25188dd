//! Control lifecycle errors.

use crate::transport::SourceError;
use std::io;
use thiserror::Error;

/// Errors returned by the scheduler and control executors.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("Source for control {code} is unavailable: {source}")]
    SourceUnavailable {
        code: String,
        #[source]
        source: SourceError,
    },

    #[error("Control {0} is already running")]
    DuplicateControl(String),

    #[error("Control {0} is not registered")]
    UnknownControl(String),

    #[error("Control {0} is still starting")]
    ControlStarting(String),

    #[error("Control {0} was already started")]
    AlreadyStarted(String),

    #[error("Scheduler is shutting down, control {0} not added")]
    ShuttingDown(String),

    #[error("Failed to spawn thread for control {code}: {source}")]
    Spawn {
        code: String,
        #[source]
        source: io::Error,
    },

    #[error("Detector for control {code} could not be created: {message}")]
    Detector { code: String, message: String },

    #[error("Invalid control: {0}")]
    InvalidControl(#[from] crate::config::ConfigValidationError),
}

impl AnalyzerError {
    /// Whether the error is caller misuse rather than a runtime failure.
    pub fn is_lifecycle_misuse(&self) -> bool {
        matches!(
            self,
            AnalyzerError::DuplicateControl(_)
                | AnalyzerError::UnknownControl(_)
                | AnalyzerError::ControlStarting(_)
                | AnalyzerError::AlreadyStarted(_)
                | AnalyzerError::ShuttingDown(_)
        )
    }
}
