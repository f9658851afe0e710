// Settings Model
// Daemon-wide configuration

use serde::{Deserialize, Serialize};

fn default_camera_device() -> String {
    "auto".to_string()
}

fn default_capture_width() -> u32 {
    1280
}

fn default_capture_height() -> u32 {
    720
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_warmup_delay_ms() -> u64 {
    1000
}

fn default_capture_timeout_secs() -> u64 {
    10
}

fn default_publish_snapshots() -> bool {
    true
}

fn default_log_retention_days() -> u32 {
    30
}

fn default_ffmpeg_path() -> String {
    String::new()
}

fn default_show_notifications() -> bool {
    true
}

/// Which way the requested camera points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CameraFacing {
    #[default]
    Front,
    Back,
}

impl std::fmt::Display for CameraFacing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraFacing::Front => write!(f, "front"),
            CameraFacing::Back => write!(f, "back"),
        }
    }
}

/// Daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    // Camera
    #[serde(default = "default_camera_device")]
    pub camera_device: String,
    #[serde(default)]
    pub camera_facing: CameraFacing,
    #[serde(default = "default_capture_width")]
    pub capture_width: u32,
    #[serde(default = "default_capture_height")]
    pub capture_height: u32,

    // Capture pipeline
    #[serde(default = "default_warmup_delay_ms")]
    pub warmup_delay_ms: u64,
    #[serde(default = "default_capture_timeout_secs")]
    pub capture_timeout_secs: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    // Storage
    #[serde(default)]
    pub snapshots_dir: String,
    #[serde(default = "default_publish_snapshots")]
    pub publish_snapshots: bool,
    #[serde(default)]
    pub publish_dir: String,
    #[serde(default)]
    pub snapshot_retention_days: u32,

    // Log retention
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,

    // FFmpeg
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    // Notifications
    #[serde(default = "default_show_notifications")]
    pub show_notifications: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            camera_device: default_camera_device(),
            camera_facing: CameraFacing::Front,
            capture_width: default_capture_width(),
            capture_height: default_capture_height(),
            warmup_delay_ms: default_warmup_delay_ms(),
            capture_timeout_secs: default_capture_timeout_secs(),
            jpeg_quality: default_jpeg_quality(),
            snapshots_dir: String::new(),
            publish_snapshots: true,
            publish_dir: String::new(),
            snapshot_retention_days: 0,
            log_retention_days: default_log_retention_days(),
            ffmpeg_path: default_ffmpeg_path(),
            show_notifications: true,
        }
    }
}
