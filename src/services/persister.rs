// Image Persister Service
// Durable snapshot writes, publication, catalog, and retention

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;

use super::camera::{Frame, PixelFormat};
use crate::models::{CapturedImage, SnapshotInfo, Visibility};

/// Snapshot file name prefix, shared by the catalog and retention scans
const SNAPSHOT_PREFIX: &str = "SECURITY_";

/// Persist failures
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("Failed to write image: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode image: {0}")]
    Encode(String),
}

/// Ensure a directory exists with owner-only permissions
pub fn ensure_secure_directory(dir: &Path) -> Result<(), String> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Failed to create directory: {}", e))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(dir, perms)
            .map_err(|e| format!("Failed to set directory permissions: {}", e))?;
    }

    Ok(())
}

/// Writes captured frames under the snapshots directory and optionally
/// copies them into a shared pictures directory for external viewers
pub struct ImagePersister {
    snapshots_dir: PathBuf,
    publish_dir: Option<PathBuf>,
    jpeg_quality: u8,
}

impl ImagePersister {
    /// Create the persister, preferring `preferred_dir` and falling back to
    /// `fallback_dir` when the preferred one cannot be prepared.
    pub fn new(
        preferred_dir: PathBuf,
        fallback_dir: PathBuf,
        publish_dir: Option<PathBuf>,
        jpeg_quality: u8,
    ) -> Result<Self, String> {
        let snapshots_dir = match ensure_secure_directory(&preferred_dir) {
            Ok(()) => preferred_dir,
            Err(e) => {
                log::warn!(
                    "Snapshots directory {} unusable ({}), falling back to {}",
                    preferred_dir.display(),
                    e,
                    fallback_dir.display()
                );
                ensure_secure_directory(&fallback_dir)?;
                fallback_dir
            }
        };

        Ok(Self {
            snapshots_dir,
            publish_dir,
            jpeg_quality,
        })
    }

    pub fn snapshots_dir(&self) -> &Path {
        &self.snapshots_dir
    }

    pub fn publish_enabled(&self) -> bool {
        self.publish_dir.is_some()
    }

    /// `SECURITY_<yyyyMMdd_HHmmss>.jpg`, salted when two captures land in
    /// the same second
    fn snapshot_path(&self) -> PathBuf {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = self
            .snapshots_dir
            .join(format!("{SNAPSHOT_PREFIX}{timestamp}.jpg"));
        if !path.exists() {
            return path;
        }

        use rand::Rng;
        let salt: u16 = rand::thread_rng().gen();
        self.snapshots_dir
            .join(format!("{SNAPSHOT_PREFIX}{timestamp}_{salt:04x}.jpg"))
    }

    /// Encode the frame as JPEG and flush it to its final path
    pub fn save(&self, frame: &Frame) -> Result<CapturedImage, SaveError> {
        frame
            .validate()
            .map_err(|reason| SaveError::Encode(reason.to_string()))?;
        let jpeg = self.encode_jpeg(frame)?;

        let final_path = self.snapshot_path();
        let tmp_path = final_path.with_extension("jpg.tmp");

        let mut image = CapturedImage {
            file_path: final_path.to_string_lossy().to_string(),
            size_bytes: jpeg.len() as u64,
            created_at: chrono::Utc::now(),
            visibility: Visibility::PendingWrite,
        };

        std::fs::write(&tmp_path, &jpeg)?;
        std::fs::rename(&tmp_path, &final_path)?;
        image.visibility = Visibility::Written;

        log::info!(
            "Snapshot saved: {} ({} bytes)",
            image.file_path,
            image.size_bytes
        );
        Ok(image)
    }

    fn encode_jpeg(&self, frame: &Frame) -> Result<Vec<u8>, SaveError> {
        use image::{ImageBuffer, Rgb};

        let rgb = match frame.pixel_format {
            PixelFormat::RGB24 => frame.data.clone(),
            PixelFormat::BGRA => frame
                .data
                .chunks_exact(4)
                .flat_map(|p| [p[2], p[1], p[0]])
                .collect(),
            PixelFormat::NV12 => {
                return Err(SaveError::Encode(
                    "nv12 frames are not supported".to_string(),
                ));
            }
        };

        let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_raw(frame.width, frame.height, rgb).ok_or_else(|| {
                SaveError::Encode("frame buffer does not match dimensions".to_string())
            })?;

        let mut jpeg_data = Vec::new();
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg_data, self.jpeg_quality);
        encoder
            .encode(
                img.as_raw(),
                frame.width,
                frame.height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| SaveError::Encode(e.to_string()))?;

        Ok(jpeg_data)
    }

    /// Copy a written snapshot into the shared pictures directory so
    /// external viewers can discover it. Failure leaves the snapshot valid.
    pub fn publish(&self, image: &CapturedImage) -> Result<PathBuf, String> {
        let publish_dir = self
            .publish_dir
            .as_ref()
            .ok_or_else(|| "publication disabled".to_string())?;

        std::fs::create_dir_all(publish_dir)
            .map_err(|e| format!("Failed to create publish directory: {e}"))?;

        let source = PathBuf::from(&image.file_path);
        let file_name = source
            .file_name()
            .ok_or_else(|| "snapshot path has no file name".to_string())?;
        let dest = publish_dir.join(file_name);

        std::fs::copy(&source, &dest).map_err(|e| format!("Failed to copy snapshot: {e}"))?;

        log::info!("Snapshot published: {} (image/jpeg, security)", dest.display());
        Ok(dest)
    }

    /// List snapshots on disk, newest first
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, String> {
        let entries = std::fs::read_dir(&self.snapshots_dir)
            .map_err(|e| format!("Failed to read snapshots directory: {e}"))?;

        let mut snapshots = Vec::new();

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !file_name.starts_with(SNAPSHOT_PREFIX) || !file_name.ends_with(".jpg") {
                continue;
            }

            let metadata = std::fs::metadata(&path).ok();
            snapshots.push(SnapshotInfo {
                file_name: file_name.to_string(),
                file_path: path.to_string_lossy().to_string(),
                size_bytes: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
                created_at: metadata
                    .and_then(|m| m.created().or_else(|_| m.modified()).ok())
                    .map(chrono::DateTime::<chrono::Utc>::from)
                    .unwrap_or_else(chrono::Utc::now),
            });
        }

        // Sort by creation time (newest first)
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(snapshots)
    }

    /// Remove snapshots older than the retention window. 0 disables pruning.
    pub fn prune_snapshots(&self, retention_days: u32) -> Result<usize, String> {
        if retention_days == 0 {
            return Ok(0);
        }
        if !self.snapshots_dir.exists() {
            return Ok(0);
        }

        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(retention_days as u64 * 24 * 60 * 60))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let entries = std::fs::read_dir(&self.snapshots_dir)
            .map_err(|e| format!("Failed to read snapshots directory: {e}"))?;
        let mut removed = 0;

        for entry in entries.flatten() {
            let path = entry.path();
            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !file_name.starts_with(SNAPSHOT_PREFIX) || !file_name.ends_with(".jpg") {
                continue;
            }

            let modified = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if modified < cutoff && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::camera::mock::test_frame;

    fn persister_in(dir: &Path) -> ImagePersister {
        ImagePersister::new(dir.join("snapshots"), dir.join("fallback"), None, 85).unwrap()
    }

    #[test]
    fn test_save_writes_jpeg_with_security_name() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister_in(dir.path());

        let image = persister.save(&test_frame(8, 6)).unwrap();
        assert_eq!(image.visibility, Visibility::Written);

        let path = PathBuf::from(&image.file_path);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("SECURITY_"));
        assert!(name.ends_with(".jpg"));
        // SECURITY_ + yyyyMMdd_HHmmss + .jpg
        assert_eq!(name.len(), "SECURITY_".len() + 15 + ".jpg".len());

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..3], &[0xFF, 0xD8, 0xFF]);
        // no stray temp file left behind
        assert!(!path.with_extension("jpg.tmp").exists());
    }

    #[test]
    fn test_same_second_saves_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister_in(dir.path());

        let first = persister.save(&test_frame(8, 6)).unwrap();
        let second = persister.save(&test_frame(8, 6)).unwrap();
        assert_ne!(first.file_path, second.file_path);
        assert_eq!(persister.list_snapshots().unwrap().len(), 2);
    }

    #[test]
    fn test_save_rejects_degenerate_frame() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister_in(dir.path());

        let mut frame = test_frame(8, 6);
        frame.data.truncate(10);
        assert!(matches!(persister.save(&frame), Err(SaveError::Encode(_))));
        assert!(persister.list_snapshots().unwrap().is_empty());
    }

    #[test]
    fn test_fallback_directory_used_when_preferred_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        // a file where the preferred directory should go
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"x").unwrap();

        let persister =
            ImagePersister::new(blocked.join("snapshots"), dir.path().join("fallback"), None, 85)
                .unwrap();
        assert_eq!(persister.snapshots_dir(), dir.path().join("fallback"));
    }

    #[test]
    fn test_publish_copies_into_publish_dir() {
        let dir = tempfile::tempdir().unwrap();
        let publish_dir = dir.path().join("pictures");
        let persister = ImagePersister::new(
            dir.path().join("snapshots"),
            dir.path().join("fallback"),
            Some(publish_dir.clone()),
            85,
        )
        .unwrap();

        let image = persister.save(&test_frame(8, 6)).unwrap();
        let dest = persister.publish(&image).unwrap();
        assert!(dest.starts_with(&publish_dir));
        assert!(dest.exists());
    }

    #[test]
    fn test_publish_disabled_errors_without_touching_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister_in(dir.path());
        assert!(!persister.publish_enabled());

        let image = persister.save(&test_frame(8, 6)).unwrap();
        assert!(persister.publish(&image).is_err());
        assert!(PathBuf::from(&image.file_path).exists());
    }

    #[test]
    fn test_list_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister_in(dir.path());

        persister.save(&test_frame(8, 6)).unwrap();
        std::fs::write(persister.snapshots_dir().join("notes.txt"), b"x").unwrap();
        std::fs::write(persister.snapshots_dir().join("SECURITY_x.jpg.tmp"), b"x").unwrap();

        let snapshots = persister.list_snapshots().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].file_name.ends_with(".jpg"));
    }

    #[test]
    fn test_prune_zero_retention_is_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister_in(dir.path());
        persister.save(&test_frame(8, 6)).unwrap();
        assert_eq!(persister.prune_snapshots(0).unwrap(), 0);
        assert_eq!(persister.list_snapshots().unwrap().len(), 1);
    }

    #[test]
    fn test_prune_keeps_fresh_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister_in(dir.path());
        persister.save(&test_frame(8, 6)).unwrap();
        assert_eq!(persister.prune_snapshots(7).unwrap(), 0);
        assert_eq!(persister.list_snapshots().unwrap().len(), 1);
    }
}
