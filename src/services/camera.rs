// Camera Service
// Exclusive acquisition, capture, and release of the imaging device

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use crate::models::CameraFacing;

/// Pixel format of captured frame data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Red-Green-Blue, 3 bytes per pixel (camera capture default)
    RGB24,
    /// Blue-Green-Red-Alpha, 4 bytes per pixel
    BGRA,
    /// YUV 4:2:0 semi-planar (some cameras)
    NV12,
}

impl PixelFormat {
    /// FFmpeg pixel format string for rawvideo output
    pub fn ffmpeg_pix_fmt(&self) -> &'static str {
        match self {
            PixelFormat::RGB24 => "rgb24",
            PixelFormat::BGRA => "bgra",
            PixelFormat::NV12 => "nv12",
        }
    }

    /// Expected data size for given dimensions
    pub fn expected_size(&self, width: u32, height: u32) -> usize {
        let pixels = (width as usize) * (height as usize);
        match self {
            PixelFormat::RGB24 => pixels * 3,
            PixelFormat::BGRA => pixels * 4,
            PixelFormat::NV12 => pixels * 3 / 2,
        }
    }
}

/// Single still frame handed from the camera backend to the persister
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw pixel data
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format of the data
    pub pixel_format: PixelFormat,
    /// Milliseconds between device open and this frame
    pub timestamp_ms: u64,
}

impl Frame {
    /// Validate that this frame has consistent, non-degenerate data.
    /// Returns Err with a description if the frame is invalid.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.width == 0 || self.height == 0 {
            return Err("zero dimensions");
        }
        if self.data.is_empty() {
            return Err("empty data");
        }
        let expected = self.pixel_format.expected_size(self.width, self.height);
        if expected > 0 && self.data.len() < expected {
            return Err("data undersized for dimensions");
        }
        Ok(())
    }
}

/// Device acquisition failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("No {0} camera available")]
    Unavailable(CameraFacing),
    #[error("Camera already bound to another session")]
    Busy,
    #[error("Camera platform fault: {0}")]
    PlatformFault(String),
}

/// Capture failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("No camera bound for this handle")]
    NotBound,
    #[error("Capture timed out after {0}s")]
    Timeout(u64),
    #[error("Camera platform fault: {0}")]
    PlatformFault(String),
}

/// Device discovery and opening. `open` runs on the blocking pool and may
/// take as long as the platform takes to hand over the device.
pub trait CameraBackend: Send + Sync {
    /// Synchronous capability query, consulted before every acquisition
    fn probe(&self, facing: CameraFacing) -> bool;
    /// Open the device matching `facing`
    fn open(&self, facing: CameraFacing) -> Result<Box<dyn BackendSession>, AcquireError>;
}

/// An open device. Dropping the session frees the device.
pub trait BackendSession: Send {
    fn device_name(&self) -> &str;
    /// Grab one still frame. Implementations must bound their own wait so a
    /// wedged device cannot pin a blocking-pool thread forever.
    fn grab_frame(&mut self) -> Result<Frame, CaptureError>;
}

/// Ownership token for the currently bound device. Stale tokens from a
/// released or force-released binding are fenced by generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraHandle {
    generation: u64,
}

struct Slot {
    generation: u64,
    opening: bool,
    grabbing: bool,
    session: Option<Box<dyn BackendSession>>,
}

fn slot_guard(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Manages the process-wide exclusive camera binding
pub struct CameraManager {
    backend: Arc<dyn CameraBackend>,
    slot: Arc<Mutex<Slot>>,
    capture_timeout: Duration,
}

impl CameraManager {
    pub fn new(backend: Arc<dyn CameraBackend>, capture_timeout: Duration) -> Self {
        Self {
            backend,
            slot: Arc::new(Mutex::new(Slot {
                generation: 0,
                opening: false,
                grabbing: false,
                session: None,
            })),
            capture_timeout,
        }
    }

    /// Synchronous check that a device with the requested facing exists
    pub fn has_camera(&self, facing: CameraFacing) -> bool {
        self.backend.probe(facing)
    }

    pub fn is_bound(&self) -> bool {
        self.lock_slot().session.is_some()
    }

    /// Bind the device exclusively. Fails with `Busy` while another binding,
    /// open attempt, or in-flight grab is alive.
    pub async fn acquire(&self, facing: CameraFacing) -> Result<CameraHandle, AcquireError> {
        {
            let mut slot = self.lock_slot();
            if slot.opening || slot.grabbing || slot.session.is_some() {
                return Err(AcquireError::Busy);
            }
            slot.opening = true;
        }

        let backend = self.backend.clone();
        let opened = tokio::task::spawn_blocking(move || backend.open(facing)).await;

        let mut slot = self.lock_slot();
        slot.opening = false;
        match opened {
            Ok(Ok(session)) => {
                slot.generation += 1;
                log::info!("Camera bound: {}", session.device_name());
                slot.session = Some(session);
                Ok(CameraHandle {
                    generation: slot.generation,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(AcquireError::PlatformFault(format!(
                "camera open task failed: {e}"
            ))),
        }
    }

    /// Grab one frame from the bound device, bounded by the capture timeout.
    /// The slot stays busy to new acquisitions for as long as the grab owns
    /// the session. On timeout the binding is forfeited; the device frees
    /// (and the slot reopens) when the straggling grab finishes on the
    /// blocking pool.
    pub async fn capture(&self, handle: CameraHandle) -> Result<Frame, CaptureError> {
        let mut session = {
            let mut slot = self.lock_slot();
            if slot.generation != handle.generation {
                return Err(CaptureError::NotBound);
            }
            let Some(session) = slot.session.take() else {
                return Err(CaptureError::NotBound);
            };
            slot.grabbing = true;
            session
        };

        let slot = self.slot.clone();
        let generation = handle.generation;
        let grab = tokio::task::spawn_blocking(move || {
            let result = session.grab_frame();
            let mut slot = slot_guard(&slot);
            slot.grabbing = false;
            if slot.generation == generation {
                slot.session = Some(session);
            }
            // a binding forfeited mid-grab is dropped here, freeing the device
            result
        });

        match tokio::time::timeout(self.capture_timeout, grab).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                // the grab panicked before the put-back; its session is gone
                let mut slot = self.lock_slot();
                slot.grabbing = false;
                Err(CaptureError::PlatformFault(format!(
                    "capture task failed: {e}"
                )))
            }
            Err(_) => {
                log::warn!(
                    "Capture did not complete within {}s, forfeiting binding",
                    self.capture_timeout.as_secs()
                );
                let mut slot = self.lock_slot();
                slot.generation += 1;
                if let Some(session) = slot.session.take() {
                    // the grab finished just as the watchdog fired
                    log::info!("Camera released: {}", session.device_name());
                }
                Err(CaptureError::Timeout(self.capture_timeout.as_secs()))
            }
        }
    }

    /// Unbind and free the device. Idempotent: no-ops on `None` and on
    /// handles that no longer match the current binding.
    pub fn release(&self, handle: Option<CameraHandle>) {
        let Some(handle) = handle else {
            log::debug!("Release without a handle, nothing bound");
            return;
        };
        let mut slot = self.lock_slot();
        if slot.generation != handle.generation {
            log::debug!("Release for stale camera handle ignored");
            return;
        }
        slot.generation += 1;
        if let Some(session) = slot.session.take() {
            log::info!("Camera released: {}", session.device_name());
        }
    }

    /// Force-release the current binding regardless of who holds the handle
    pub fn release_all(&self) {
        let mut slot = self.lock_slot();
        slot.generation += 1;
        if let Some(session) = slot.session.take() {
            log::info!("Camera force-released: {}", session.device_name());
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        slot_guard(&self.slot)
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.release_all();
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockBackend;
    use super::*;

    fn manager_with(backend: Arc<MockBackend>) -> CameraManager {
        CameraManager::new(backend, Duration::from_millis(200))
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_pixel_format_sizes() {
        assert_eq!(PixelFormat::RGB24.expected_size(1280, 720), 1280 * 720 * 3);
        assert_eq!(PixelFormat::BGRA.expected_size(1920, 1080), 1920 * 1080 * 4);
        assert_eq!(PixelFormat::NV12.expected_size(1920, 1080), 1920 * 1080 * 3 / 2);
    }

    #[test]
    fn test_pixel_format_ffmpeg() {
        assert_eq!(PixelFormat::RGB24.ffmpeg_pix_fmt(), "rgb24");
        assert_eq!(PixelFormat::BGRA.ffmpeg_pix_fmt(), "bgra");
        assert_eq!(PixelFormat::NV12.ffmpeg_pix_fmt(), "nv12");
    }

    #[test]
    fn test_validate_valid_frame() {
        assert!(mock::test_frame(8, 6).validate().is_ok());
    }

    #[test]
    fn test_validate_zero_dimensions() {
        let mut frame = mock::test_frame(8, 6);
        frame.width = 0;
        assert_eq!(frame.validate(), Err("zero dimensions"));
    }

    #[test]
    fn test_validate_empty_data() {
        let mut frame = mock::test_frame(8, 6);
        frame.data.clear();
        assert_eq!(frame.validate(), Err("empty data"));
    }

    #[test]
    fn test_validate_undersized_data() {
        let mut frame = mock::test_frame(8, 6);
        frame.data.truncate(10);
        assert_eq!(frame.validate(), Err("data undersized for dimensions"));
    }

    #[tokio::test]
    async fn test_acquire_capture_release_cycle() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(backend.clone());

        let handle = manager.acquire(CameraFacing::Front).await.unwrap();
        assert!(manager.is_bound());

        let frame = manager.capture(handle).await.unwrap();
        assert!(frame.validate().is_ok());
        // session goes back into the slot after a successful grab
        assert!(manager.is_bound());

        manager.release(Some(handle));
        assert!(!manager.is_bound());
        assert_eq!(backend.opens(), 1);
        assert_eq!(backend.closes(), 1);
    }

    #[tokio::test]
    async fn test_second_acquire_is_busy() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(backend.clone());

        let handle = manager.acquire(CameraFacing::Front).await.unwrap();
        assert_eq!(
            manager.acquire(CameraFacing::Front).await,
            Err(AcquireError::Busy)
        );

        manager.release(Some(handle));
        assert!(manager.acquire(CameraFacing::Front).await.is_ok());
        assert_eq!(backend.opens(), 2);
    }

    #[tokio::test]
    async fn test_acquire_is_busy_while_grab_in_flight() {
        let backend = Arc::new(MockBackend::new());
        backend.set_grab_delay(Duration::from_millis(400));
        let manager = Arc::new(CameraManager::new(backend.clone(), Duration::from_secs(2)));

        let handle = manager.acquire(CameraFacing::Front).await.unwrap();
        let capture = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.capture(handle).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // the grab owns the session; a second acquire must not double-open
        assert_eq!(
            manager.acquire(CameraFacing::Front).await,
            Err(AcquireError::Busy)
        );

        assert!(capture.await.unwrap().is_ok());
        assert_eq!(backend.opens(), 1);
        manager.release(Some(handle));
        assert_eq!(backend.closes(), 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(backend.clone());

        let handle = manager.acquire(CameraFacing::Front).await.unwrap();
        manager.release(Some(handle));
        manager.release(Some(handle));
        manager.release(None);

        assert_eq!(backend.closes(), 1);
    }

    #[tokio::test]
    async fn test_stale_release_after_force_release() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(backend.clone());

        let stale = manager.acquire(CameraFacing::Front).await.unwrap();
        manager.release_all();
        assert_eq!(backend.closes(), 1);

        let fresh = manager.acquire(CameraFacing::Front).await.unwrap();
        // the stale token must not unbind the new session
        manager.release(Some(stale));
        assert!(manager.is_bound());
        manager.release(Some(fresh));
        assert_eq!(backend.closes(), 2);
    }

    #[tokio::test]
    async fn test_capture_after_release_is_not_bound() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(backend);

        let handle = manager.acquire(CameraFacing::Front).await.unwrap();
        manager.release(Some(handle));
        assert!(matches!(
            manager.capture(handle).await,
            Err(CaptureError::NotBound)
        ));
    }

    #[tokio::test]
    async fn test_open_failure_propagates() {
        let backend = Arc::new(MockBackend::new());
        backend.set_fail_open(AcquireError::PlatformFault("driver gone".to_string()));
        let manager = manager_with(backend.clone());

        let result = manager.acquire(CameraFacing::Front).await;
        assert_eq!(
            result,
            Err(AcquireError::PlatformFault("driver gone".to_string()))
        );
        // a failed open must not leave the slot marked busy
        backend.set_has_device(false);
        assert_eq!(
            manager.acquire(CameraFacing::Front).await,
            Err(AcquireError::Unavailable(CameraFacing::Front))
        );
    }

    #[tokio::test]
    async fn test_capture_timeout_forfeits_binding() {
        let backend = Arc::new(MockBackend::new());
        backend.set_grab_delay(Duration::from_millis(600));
        let manager = CameraManager::new(backend.clone(), Duration::from_millis(50));

        let handle = manager.acquire(CameraFacing::Front).await.unwrap();
        assert!(matches!(
            manager.capture(handle).await,
            Err(CaptureError::Timeout(_))
        ));
        assert!(!manager.is_bound());

        manager.release(Some(handle));
        // straggling grab finishes on the blocking pool and frees the device
        wait_for(|| backend.closes() == 1).await;
        assert_eq!(backend.opens(), 1);
    }

    #[tokio::test]
    async fn test_acquire_after_timeout_waits_for_straggler() {
        let backend = Arc::new(MockBackend::new());
        backend.set_grab_delay(Duration::from_millis(400));
        let manager = CameraManager::new(backend.clone(), Duration::from_millis(50));

        let handle = manager.acquire(CameraFacing::Front).await.unwrap();
        assert!(matches!(
            manager.capture(handle).await,
            Err(CaptureError::Timeout(_))
        ));
        manager.release(Some(handle));

        // the straggling grab still holds the physical device
        assert_eq!(
            manager.acquire(CameraFacing::Front).await,
            Err(AcquireError::Busy)
        );

        wait_for(|| backend.closes() == 1).await;
        assert!(manager.acquire(CameraFacing::Front).await.is_ok());
        assert_eq!(backend.opens(), 2);
    }

    #[tokio::test]
    async fn test_grab_failure_returns_session_to_slot() {
        let backend = Arc::new(MockBackend::new());
        backend.set_fail_grab(CaptureError::PlatformFault("sensor stall".to_string()));
        let manager = manager_with(backend.clone());

        let handle = manager.acquire(CameraFacing::Front).await.unwrap();
        assert!(matches!(
            manager.capture(handle).await,
            Err(CaptureError::PlatformFault(_))
        ));
        // failure keeps the binding so release still observes it
        assert!(manager.is_bound());
        manager.release(Some(handle));
        assert_eq!(backend.closes(), 1);
    }

    #[tokio::test]
    async fn test_has_camera_tracks_backend() {
        let backend = Arc::new(MockBackend::new());
        let manager = manager_with(backend.clone());
        assert!(manager.has_camera(CameraFacing::Front));
        backend.set_has_device(false);
        assert!(!manager.has_camera(CameraFacing::Front));
    }
}
