// FFmpeg Camera Backend
// Device discovery and single-frame grabs via an ffmpeg subprocess

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use super::camera::{
    AcquireError, BackendSession, CameraBackend, CaptureError, Frame, PixelFormat,
};
use crate::models::CameraFacing;

// Windows: Hide console windows
#[cfg(windows)]
use std::os::windows::process::CommandExt;
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

const FRONT_HINTS: &[&str] = &["front", "facetime", "integrated", "user", "internal"];
const BACK_HINTS: &[&str] = &["back", "rear", "environment"];

/// Information about an available camera device
#[derive(Debug, Clone)]
pub struct CameraDevice {
    pub id: String,
    pub name: String,
    pub device_path: String,
}

fn matches_facing(name: &str, facing: CameraFacing) -> bool {
    let name = name.to_lowercase();
    let hints = match facing {
        CameraFacing::Front => FRONT_HINTS,
        CameraFacing::Back => BACK_HINTS,
    };
    hints.iter().any(|hint| name.contains(hint))
}

/// Camera backend that shells out to FFmpeg for single-frame grabs
pub struct FfmpegBackend {
    ffmpeg_path: String,
    device_override: Option<String>,
    width: u32,
    height: u32,
    grab_timeout: Duration,
}

impl FfmpegBackend {
    pub fn new(ffmpeg_path: String, width: u32, height: u32, grab_timeout: Duration) -> Self {
        Self {
            ffmpeg_path,
            device_override: None,
            width,
            height,
            grab_timeout,
        }
    }

    /// Pin capture to an explicit device instead of facing-based discovery.
    /// Empty and "auto" keep discovery enabled.
    pub fn with_device(mut self, device_path: impl Into<String>) -> Self {
        let device_path = device_path.into();
        if !device_path.is_empty() && device_path != "auto" {
            self.device_override = Some(device_path);
        }
        self
    }

    /// Resolve the ffmpeg binary: explicit settings path first, then PATH
    pub fn resolve_ffmpeg_path(configured: &str) -> Result<String, String> {
        if !configured.is_empty() {
            if std::path::Path::new(configured).exists() {
                return Ok(configured.to_string());
            }
            log::warn!(
                "Configured ffmpeg path {} does not exist, falling back to PATH",
                configured
            );
        }
        which::which("ffmpeg")
            .map(|path| path.to_string_lossy().to_string())
            .map_err(|_| "ffmpeg not found in PATH".to_string())
    }

    /// List available cameras using FFmpeg device enumeration
    pub fn list_devices(&self) -> Vec<CameraDevice> {
        #[cfg(target_os = "macos")]
        {
            self.list_devices_macos()
        }
        #[cfg(target_os = "windows")]
        {
            self.list_devices_windows()
        }
        #[cfg(target_os = "linux")]
        {
            self.list_devices_linux()
        }
    }

    #[cfg(target_os = "macos")]
    fn list_devices_macos(&self) -> Vec<CameraDevice> {
        // AVFoundation prints its device table on stderr
        let output = Command::new(&self.ffmpeg_path)
            .args(["-f", "avfoundation", "-list_devices", "true", "-i", ""])
            .stderr(Stdio::piped())
            .output();

        let mut devices = Vec::new();

        if let Ok(output) = output {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut in_video_section = false;
            let mut index = 0;

            for line in stderr.lines() {
                if line.contains("AVFoundation video devices:") {
                    in_video_section = true;
                    continue;
                }
                if line.contains("AVFoundation audio devices:") {
                    break;
                }
                if in_video_section {
                    // Device line like "[AVFoundation indev @ 0x...] [0] FaceTime HD Camera"
                    if let Some(bracket_pos) = line.rfind('[') {
                        let rest = &line[bracket_pos + 1..];
                        if let Some(end_bracket) = rest.find(']') {
                            if rest[..end_bracket].parse::<u32>().is_ok() {
                                let name = rest[end_bracket + 1..].trim().to_string();
                                if !name.is_empty() {
                                    devices.push(CameraDevice {
                                        id: index.to_string(),
                                        name,
                                        device_path: index.to_string(),
                                    });
                                    index += 1;
                                }
                            }
                        }
                    }
                }
            }
        }

        devices
    }

    #[cfg(target_os = "windows")]
    fn list_devices_windows(&self) -> Vec<CameraDevice> {
        let output = Command::new(&self.ffmpeg_path)
            .args(["-f", "dshow", "-list_devices", "true", "-i", "dummy"])
            .stderr(Stdio::piped())
            .output();

        let mut devices = Vec::new();

        if let Ok(output) = output {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut in_video_section = false;
            let mut index = 0;

            for line in stderr.lines() {
                if line.contains("DirectShow video devices") {
                    in_video_section = true;
                    continue;
                }
                if line.contains("DirectShow audio devices") {
                    break;
                }
                if in_video_section && line.contains('"') {
                    // Device line like '  "HD Webcam"'
                    if let Some(start) = line.find('"') {
                        if let Some(end) = line[start + 1..].find('"') {
                            let name = line[start + 1..start + 1 + end].to_string();
                            devices.push(CameraDevice {
                                id: index.to_string(),
                                device_path: format!("video={}", name),
                                name,
                            });
                            index += 1;
                        }
                    }
                }
            }
        }

        devices
    }

    #[cfg(target_os = "linux")]
    fn list_devices_linux(&self) -> Vec<CameraDevice> {
        let mut devices = Vec::new();

        if let Ok(entries) = std::fs::read_dir("/dev") {
            for entry in entries.flatten() {
                let path = entry.path();
                if let Some(name) = path.file_name() {
                    let name_str = name.to_string_lossy();
                    if name_str.starts_with("video") {
                        let device_path = path.to_string_lossy().to_string();

                        let display_name = get_v4l2_device_name(&device_path)
                            .unwrap_or_else(|| name_str.to_string());

                        devices.push(CameraDevice {
                            id: name_str.to_string(),
                            name: display_name,
                            device_path,
                        });
                    }
                }
            }
        }

        devices.sort_by(|a, b| a.device_path.cmp(&b.device_path));
        devices
    }

    fn pick_device(&self, facing: CameraFacing) -> Option<CameraDevice> {
        if let Some(path) = &self.device_override {
            return Some(CameraDevice {
                id: path.clone(),
                name: path.clone(),
                device_path: path.clone(),
            });
        }

        let devices = self.list_devices();
        if let Some(device) = devices.iter().find(|d| matches_facing(&d.name, facing)) {
            return Some(device.clone());
        }

        // Most machines expose a single unnamed webcam and it faces the user
        match facing {
            CameraFacing::Front => devices.into_iter().next(),
            CameraFacing::Back => None,
        }
    }
}

#[cfg(target_os = "linux")]
fn get_v4l2_device_name(device_path: &str) -> Option<String> {
    let output = Command::new("v4l2-ctl")
        .args(["--device", device_path, "--info"])
        .output()
        .ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        if line.contains("Card type") {
            return line.split(':').nth(1).map(|s| s.trim().to_string());
        }
    }
    None
}

impl CameraBackend for FfmpegBackend {
    fn probe(&self, facing: CameraFacing) -> bool {
        self.pick_device(facing).is_some()
    }

    fn open(&self, facing: CameraFacing) -> Result<Box<dyn BackendSession>, AcquireError> {
        let device = self
            .pick_device(facing)
            .ok_or(AcquireError::Unavailable(facing))?;

        // Hold the V4L2 node open for the lifetime of the binding
        #[cfg(target_os = "linux")]
        let guard = match std::fs::File::open(&device.device_path) {
            Ok(file) => Some(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AcquireError::Unavailable(facing));
            }
            Err(e) => {
                return Err(AcquireError::PlatformFault(format!(
                    "failed to open {}: {}",
                    device.device_path, e
                )));
            }
        };
        #[cfg(not(target_os = "linux"))]
        let guard = None;

        log::info!("Opening camera {} ({})", device.name, device.device_path);
        Ok(Box::new(FfmpegSession {
            ffmpeg_path: self.ffmpeg_path.clone(),
            device,
            width: self.width,
            height: self.height,
            grab_timeout: self.grab_timeout,
            opened_at: Instant::now(),
            _device_guard: guard,
        }))
    }
}

/// One bound camera. The grab spawns a short-lived ffmpeg process that
/// writes a single raw frame to stdout.
struct FfmpegSession {
    ffmpeg_path: String,
    device: CameraDevice,
    width: u32,
    height: u32,
    grab_timeout: Duration,
    opened_at: Instant,
    _device_guard: Option<std::fs::File>,
}

impl BackendSession for FfmpegSession {
    fn device_name(&self) -> &str {
        &self.device.name
    }

    fn grab_frame(&mut self) -> Result<Frame, CaptureError> {
        let video_size = format!("{}x{}", self.width, self.height);
        let device_path = &self.device.device_path;

        let mut args: Vec<&str> = Vec::new();

        #[cfg(target_os = "macos")]
        {
            args.extend([
                "-f", "avfoundation",
                "-framerate", "30",
                "-video_size", &video_size,
                "-i", device_path,
            ]);
        }

        #[cfg(target_os = "windows")]
        {
            args.extend([
                "-f", "dshow",
                "-video_size", &video_size,
                "-i", device_path,
            ]);
        }

        #[cfg(target_os = "linux")]
        {
            args.extend([
                "-f", "v4l2",
                "-video_size", &video_size,
                "-i", device_path,
            ]);
        }

        // Exactly one raw frame to stdout
        args.extend([
            "-frames:v", "1",
            "-f", "rawvideo",
            "-pix_fmt", PixelFormat::RGB24.ffmpeg_pix_fmt(),
            "-",
        ]);

        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd
            .spawn()
            .map_err(|e| CaptureError::PlatformFault(format!("failed to start ffmpeg: {e}")))?;

        // Log ffmpeg stderr and keep a short tail for error reports
        let stderr_tail: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut stderr_thread = None;
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            let device_id = self.device.id.clone();
            stderr_thread = Some(std::thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    match line {
                        Ok(line) if !line.trim().is_empty() => {
                            if line.contains("error")
                                || line.contains("Error")
                                || line.contains("Invalid")
                            {
                                log::warn!("[CameraFFmpeg:{}] {}", device_id, line.trim());
                            } else {
                                log::debug!("[CameraFFmpeg:{}] {}", device_id, line.trim());
                            }
                            if let Ok(mut tail) = tail.lock() {
                                if tail.len() == 5 {
                                    tail.remove(0);
                                }
                                tail.push(line.trim().to_string());
                            }
                        }
                        Err(_) => break,
                        _ => {}
                    }
                }
            }));
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            CaptureError::PlatformFault("failed to capture ffmpeg stdout".to_string())
        })?;

        let frame_size = PixelFormat::RGB24.expected_size(self.width, self.height);
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut buffer = vec![0u8; frame_size];
            let result = reader.read_exact(&mut buffer).map(|_| buffer);
            let _ = tx.send(result);
        });

        let outcome = rx.recv_timeout(self.grab_timeout);

        // Reap the child on every path so a straggler cannot hold the device
        let _ = child.kill();
        let _ = child.wait();
        if let Some(thread) = stderr_thread {
            let _ = thread.join();
        }

        match outcome {
            Ok(Ok(data)) => {
                let frame = Frame {
                    data,
                    width: self.width,
                    height: self.height,
                    pixel_format: PixelFormat::RGB24,
                    timestamp_ms: self.opened_at.elapsed().as_millis() as u64,
                };
                frame.validate().map_err(|reason| {
                    CaptureError::PlatformFault(format!("invalid frame from ffmpeg: {reason}"))
                })?;
                Ok(frame)
            }
            Ok(Err(e)) => {
                let tail = stderr_tail
                    .lock()
                    .map(|t| t.join("; "))
                    .unwrap_or_default();
                if tail.is_empty() {
                    Err(CaptureError::PlatformFault(format!(
                        "ffmpeg produced no frame: {e}"
                    )))
                } else {
                    Err(CaptureError::PlatformFault(format!(
                        "ffmpeg produced no frame: {e} ({tail})"
                    )))
                }
            }
            Err(_) => Err(CaptureError::Timeout(self.grab_timeout.as_secs())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> FfmpegBackend {
        FfmpegBackend::new("ffmpeg".to_string(), 1280, 720, Duration::from_secs(10))
    }

    #[test]
    fn test_matches_facing() {
        assert!(matches_facing("FaceTime HD Camera", CameraFacing::Front));
        assert!(matches_facing("Integrated Webcam", CameraFacing::Front));
        assert!(matches_facing("USB Rear Camera", CameraFacing::Back));
        assert!(!matches_facing("USB Rear Camera", CameraFacing::Front));
        assert!(!matches_facing("Generic UVC Device", CameraFacing::Back));
    }

    #[test]
    fn test_device_override_bypasses_discovery() {
        let backend = backend().with_device("/dev/video9");
        let device = backend.pick_device(CameraFacing::Front).unwrap();
        assert_eq!(device.device_path, "/dev/video9");
        // back facing honors the override too
        assert!(backend.probe(CameraFacing::Back));
    }

    #[test]
    fn test_auto_keeps_discovery() {
        let backend = backend().with_device("auto");
        assert!(backend.device_override.is_none());
        let backend = backend.with_device("");
        assert!(backend.device_override.is_none());
    }

    #[test]
    fn test_list_devices() {
        let devices = backend().list_devices();
        println!("Found {} cameras", devices.len());
        for device in devices {
            println!("  - {} ({})", device.name, device.device_path);
        }
    }
}
