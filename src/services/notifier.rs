// Notifier Service
// Passive status channel for the capture pipeline

use std::path::PathBuf;
use serde::{Deserialize, Serialize};

/// Status signals the daemon can surface to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ServiceStatus {
    /// Monitoring is up and waiting for unlock signals
    Active,
    /// Camera access is not authorized; user action needed
    PermissionRequired,
    /// A capture session failed
    Error { message: String },
}

impl ServiceStatus {
    pub fn error(message: impl Into<String>) -> Self {
        ServiceStatus::Error {
            message: message.into(),
        }
    }
}

/// Fire-and-forget status sink. Implementations must return promptly and
/// never wait on the capture pipeline; a short local file write is fine,
/// network calls are not. Callers may be off the async runtime.
pub trait Notifier: Send + Sync {
    fn post_status(&self, status: &ServiceStatus);
}

pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn post_status(&self, _status: &ServiceStatus) {}
}

/// Logs each status and mirrors the latest one into a JSON file so
/// external UIs can poll the daemon's state without a socket round trip.
/// The mirror is one small synchronous write; the file always holds the
/// most recently posted status.
pub struct StatusFileNotifier {
    status_path: PathBuf,
}

/// On-disk shape: the tagged status plus a freshness stamp
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusFilePayload<'a> {
    #[serde(flatten)]
    status: &'a ServiceStatus,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl StatusFileNotifier {
    pub fn new(status_path: PathBuf) -> Self {
        Self { status_path }
    }

    fn write_status_file(&self, status: &ServiceStatus) {
        let payload = StatusFilePayload {
            status,
            updated_at: chrono::Utc::now(),
        };

        match serde_json::to_string_pretty(&payload) {
            Ok(content) => {
                if let Err(e) = std::fs::write(&self.status_path, content) {
                    log::warn!("Failed to write status file: {}", e);
                }
            }
            Err(e) => log::warn!("Failed to serialize status: {}", e),
        }
    }
}

impl Notifier for StatusFileNotifier {
    fn post_status(&self, status: &ServiceStatus) {
        match status {
            ServiceStatus::Active => log::info!("Status: active, monitoring device unlocks"),
            ServiceStatus::PermissionRequired => {
                log::warn!("Status: camera permission required")
            }
            ServiceStatus::Error { message } => log::error!("Status: {}", message),
        }
        self.write_status_file(status);
    }
}
