// Snapshot Models
// Records describing captured images on disk

use serde::{Deserialize, Serialize};

/// How far a captured image has progressed toward external visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Visibility {
    /// Encode finished, file not yet flushed to its final path
    PendingWrite,
    /// Durably written under the snapshots directory
    Written,
    /// Copied into the shared pictures directory for external viewers
    Published,
}

/// A single captured image, immutable once written
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedImage {
    pub file_path: String,
    pub size_bytes: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub visibility: Visibility,
}

/// Catalog entry for a snapshot already on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub file_name: String,
    pub file_path: String,
    pub size_bytes: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
