//! Alarm notification to the admin service.
//!
//! Reporting is fire-and-forget: a failed call is logged by the caller and
//! never invalidates the clip that was produced.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Path on the admin host that accepts new alarms.
pub const ALARM_ENDPOINT_PATH: &str = "/api/postAddAlarm";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Alarm notification request failed: {0}")]
    Http(String),

    #[error("Failed to serialize alarm notice: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Payload posted for each generated alarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlarmNotice {
    pub control_code: String,
    pub desc: String,
    pub video_path: String,
    pub image_path: String,
}

#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &AlarmNotice) -> Result<(), NotifyError>;
}

/// Posts notices as JSON over HTTP.
pub struct HttpNotifier {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpNotifier {
    pub fn new(admin_host: &str, timeout: Duration) -> Self {
        let endpoint = format!(
            "{}{}",
            admin_host.trim_end_matches('/'),
            ALARM_ENDPOINT_PATH
        );
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();

        Self { endpoint, agent }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Notifier for HttpNotifier {
    fn notify(&self, notice: &AlarmNotice) -> Result<(), NotifyError> {
        let body = serde_json::to_string(notice)?;

        self.agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .send_string(&body)
            .map_err(|e| NotifyError::Http(e.to_string()))?;

        Ok(())
    }
}

/// Used when no admin host is configured; notices only reach the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: &AlarmNotice) -> Result<(), NotifyError> {
        info!(
            control = %notice.control_code,
            video = %notice.video_path,
            image = %notice.image_path,
            "Alarm generated (no admin host configured)"
        );
        Ok(())
    }
}
