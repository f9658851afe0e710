// Permissions Service
// Platform-specific camera permission checks

use serde::{Deserialize, Serialize};

/// Permission status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionStatus {
    /// Permission has been granted
    Granted,
    /// Permission has been denied
    Denied,
    /// Permission has not been requested yet
    NotDetermined,
    /// Permission is restricted by system policy
    Restricted,
    /// Permission checking is not supported on this platform
    NotApplicable,
}

impl PermissionStatus {
    /// Whether a capture attempt should be blocked outright. NotDetermined
    /// proceeds so the platform layer can prompt or fail on first use.
    pub fn blocks_capture(&self) -> bool {
        matches!(self, PermissionStatus::Denied | PermissionStatus::Restricted)
    }
}

/// Camera permission report for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionReport {
    pub camera: PermissionStatus,
    pub platform: String,
}

/// Synchronous camera-authorization query consulted before every acquisition
pub trait PermissionProbe: Send + Sync {
    fn camera_status(&self) -> PermissionStatus;
}

/// Probe backed by the host platform
pub struct PlatformPermissions;

impl PlatformPermissions {
    /// Get the current camera permission report
    pub fn report() -> PermissionReport {
        PermissionReport {
            camera: Self::check_camera_permission(),
            platform: Self::platform_name().to_string(),
        }
    }

    /// Get platform name
    fn platform_name() -> &'static str {
        #[cfg(target_os = "macos")]
        { "macos" }
        #[cfg(target_os = "windows")]
        { "windows" }
        #[cfg(target_os = "linux")]
        { "linux" }
        #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
        { "unknown" }
    }

    /// Check camera permission status
    pub fn check_camera_permission() -> PermissionStatus {
        #[cfg(target_os = "macos")]
        {
            // On macOS the TCC prompt fires when capture is first attempted;
            // there is no check short of linking AVFoundation
            PermissionStatus::NotDetermined
        }

        #[cfg(target_os = "windows")]
        {
            // Windows doesn't gate camera access for desktop apps
            PermissionStatus::Granted
        }

        #[cfg(target_os = "linux")]
        {
            // V4L2 access is plain file permissions: if video nodes exist but
            // none is readable, the daemon's user is not in the video group
            let mut saw_device = false;
            if let Ok(entries) = std::fs::read_dir("/dev") {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if !name.starts_with("video") {
                        continue;
                    }
                    saw_device = true;
                    if std::fs::File::open(entry.path()).is_ok() {
                        return PermissionStatus::Granted;
                    }
                }
            }
            if saw_device {
                PermissionStatus::Denied
            } else {
                // Device presence is checked separately
                PermissionStatus::Granted
            }
        }

        #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
        {
            PermissionStatus::NotApplicable
        }
    }
}

impl PermissionProbe for PlatformPermissions {
    fn camera_status(&self) -> PermissionStatus {
        Self::check_camera_permission()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report() {
        let report = PlatformPermissions::report();
        // Should return some status without panicking
        assert!(!report.platform.is_empty());
    }

    #[test]
    fn test_blocks_capture() {
        assert!(PermissionStatus::Denied.blocks_capture());
        assert!(PermissionStatus::Restricted.blocks_capture());
        assert!(!PermissionStatus::Granted.blocks_capture());
        assert!(!PermissionStatus::NotDetermined.blocks_capture());
        assert!(!PermissionStatus::NotApplicable.blocks_capture());
    }
}
