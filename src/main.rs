// Lockshot Daemon
// Listens for device-unlock signals and captures a security snapshot

use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};
use std::env;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::signal;

use lockshot::models::Settings;
use lockshot::services::{
    ensure_secure_directory, CameraManager, CaptureOrchestrator, FfmpegBackend, ImagePersister,
    MonitorService, NoopNotifier, Notifier, PlatformPermissions, ServiceStatus, SettingsManager,
    StatusFileNotifier, UnlockBus,
};

#[cfg(unix)]
use lockshot::services::UnlockSignal;
#[cfg(unix)]
use serde_json::json;

// ============================================================================
// Logging
// ============================================================================

struct DaemonLogger {
    file: Mutex<std::fs::File>,
    level: LevelFilter,
}

impl DaemonLogger {
    fn new(log_dir: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let log_path = log_dir.join("lockshot.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        Ok(Self {
            file: Mutex::new(file),
            level: LevelFilter::Info,
        })
    }
}

impl Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now();
        let date = timestamp.format("%Y-%m-%d");
        let time = timestamp.format("%H:%M:%S");
        let target = record.target();
        let level = record.level();
        let message = format!("{}", record.args());
        let line = format!("[{date}][{time}][{target}][{level}] {message}");

        if let Ok(mut file) = self.file.try_lock() {
            let _ = writeln!(file, "{line}");
        }
        eprintln!("{line}");
    }

    fn flush(&self) {}
}

fn init_logger(log_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let logger = DaemonLogger::new(log_dir)?;
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(LevelFilter::Info);
    Ok(())
}

/// Remove log files older than the retention window. 0 disables pruning.
fn prune_logs(log_dir: &Path, retention_days: u32) -> Result<usize, String> {
    if retention_days == 0 {
        return Ok(0);
    }
    if !log_dir.exists() {
        return Ok(0);
    }

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention_days as u64 * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let entries =
        std::fs::read_dir(log_dir).map_err(|e| format!("Failed to read log dir: {e}"))?;
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("log") {
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

// ============================================================================
// Unlock feed (unix socket line protocol)
// ============================================================================

#[cfg(unix)]
fn spawn_feed_listener(
    socket_path: PathBuf,
    bus: UnlockBus,
    monitor: Arc<MonitorService>,
    persister: Arc<ImagePersister>,
) -> Result<(), Box<dyn std::error::Error>> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    // a previous run may have left its socket behind
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    log::info!("Unlock feed listening on {}", socket_path.display());

    tokio::spawn(async move {
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    log::warn!("Unlock feed accept failed: {}", e);
                    continue;
                }
            };

            let bus = bus.clone();
            let monitor = monitor.clone();
            let persister = persister.clone();
            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut reply = handle_feed_line(&line, &bus, &monitor, &persister);
                    reply.push('\n');
                    if writer.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    Ok(())
}

#[cfg(unix)]
fn handle_feed_line(
    line: &str,
    bus: &UnlockBus,
    monitor: &MonitorService,
    persister: &ImagePersister,
) -> String {
    if let Some(signal) = UnlockSignal::parse(line) {
        bus.publish(signal);
        return "ok".to_string();
    }

    match line.trim().to_lowercase().as_str() {
        "status" => json!({ "running": monitor.is_running() }).to_string(),
        "list" => match persister.list_snapshots() {
            Ok(snapshots) => {
                serde_json::to_string(&snapshots).unwrap_or_else(|_| "[]".to_string())
            }
            Err(e) => json!({ "error": e }).to_string(),
        },
        "start" => {
            monitor.start();
            "ok".to_string()
        }
        "stop" => {
            monitor.stop();
            "ok".to_string()
        }
        other => {
            log::warn!("Unlock feed received unknown command: {}", other);
            json!({ "error": "unknown command" }).to_string()
        }
    }
}

// ============================================================================
// Shutdown
// ============================================================================

/// Graceful shutdown signal handler.
/// Waits for Ctrl+C or SIGTERM, then stops the monitor and orchestrator.
async fn shutdown_signal(monitor: Arc<MonitorService>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("Shutdown signal received, stopping services...");
    monitor.shutdown().await;
    log::info!("All services stopped, daemon shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration from environment
    let data_dir = env::var("LOCKSHOT_DATA_DIR").unwrap_or_else(|_| {
        dirs_next::data_local_dir()
            .map(|dir| dir.join("lockshot").to_string_lossy().to_string())
            .unwrap_or_else(|| "data".to_string())
    });
    let log_dir = env::var("LOCKSHOT_LOG_DIR").unwrap_or_else(|_| format!("{data_dir}/logs"));

    let app_data_dir = PathBuf::from(&data_dir);
    let log_dir_path = PathBuf::from(&log_dir);
    ensure_secure_directory(&app_data_dir)?;
    std::fs::create_dir_all(&log_dir_path)?;

    init_logger(&log_dir_path)?;
    log::info!("Lockshot daemon starting (data dir: {})", app_data_dir.display());

    let settings_manager = Arc::new(SettingsManager::new(app_data_dir.clone()));
    let settings = match settings_manager.load() {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("Settings unavailable ({}), using defaults", e);
            Settings::default()
        }
    };

    match prune_logs(&log_dir_path, settings.log_retention_days) {
        Ok(0) => {}
        Ok(removed) => log::info!("Pruned {} old log file(s)", removed),
        Err(e) => log::warn!("Log pruning failed: {}", e),
    }

    // Camera stack
    let ffmpeg_path = FfmpegBackend::resolve_ffmpeg_path(&settings.ffmpeg_path)?;
    log::info!("Using ffmpeg at {}", ffmpeg_path);

    let capture_timeout = Duration::from_secs(settings.capture_timeout_secs);
    // the child process gets a little longer than the watchdog so the
    // timeout classification always comes from the manager
    let child_timeout = capture_timeout + Duration::from_secs(2);
    let backend = Arc::new(
        FfmpegBackend::new(
            ffmpeg_path,
            settings.capture_width,
            settings.capture_height,
            child_timeout,
        )
        .with_device(settings.camera_device.clone()),
    );
    let manager = Arc::new(CameraManager::new(backend, capture_timeout));

    // Storage
    let preferred_snapshots = if settings.snapshots_dir.is_empty() {
        app_data_dir.join("snapshots")
    } else {
        PathBuf::from(&settings.snapshots_dir)
    };
    let publish_dir = if settings.publish_snapshots {
        let configured = if settings.publish_dir.is_empty() {
            dirs_next::picture_dir().map(|dir| dir.join("Lockshot"))
        } else {
            Some(PathBuf::from(&settings.publish_dir))
        };
        if configured.is_none() {
            log::warn!("No pictures directory on this system, snapshot publication disabled");
        }
        configured
    } else {
        None
    };
    let persister = Arc::new(ImagePersister::new(
        preferred_snapshots,
        app_data_dir.join("snapshots"),
        publish_dir,
        settings.jpeg_quality,
    )?);

    match persister.prune_snapshots(settings.snapshot_retention_days) {
        Ok(0) => {}
        Ok(removed) => log::info!("Pruned {} old snapshot(s)", removed),
        Err(e) => log::warn!("Snapshot pruning failed: {}", e),
    }
    if let Ok(snapshots) = persister.list_snapshots() {
        log::info!("Found {} existing snapshot(s)", snapshots.len());
    }

    // Status channel
    let notifier: Arc<dyn Notifier> = if settings.show_notifications {
        Arc::new(StatusFileNotifier::new(app_data_dir.join("status.json")))
    } else {
        Arc::new(NoopNotifier)
    };

    let report = PlatformPermissions::report();
    log::info!(
        "Camera permission on {}: {:?}",
        report.platform,
        report.camera
    );

    // Capture pipeline
    let orchestrator = CaptureOrchestrator::new(
        manager,
        persister.clone(),
        notifier.clone(),
        Arc::new(PlatformPermissions),
        settings.camera_facing,
        Duration::from_millis(settings.warmup_delay_ms),
    );
    let capture = orchestrator.handle();
    tokio::spawn(orchestrator.run());

    let bus = UnlockBus::new();
    let monitor = Arc::new(MonitorService::new(bus.clone(), capture, notifier.clone()));
    monitor.start();
    if report.camera.blocks_capture() {
        notifier.post_status(&ServiceStatus::PermissionRequired);
    }

    log::info!(
        "Monitoring unlocks ({} camera, {}x{}, warm-up {}ms, watchdog {}s)",
        settings.camera_facing,
        settings.capture_width,
        settings.capture_height,
        settings.warmup_delay_ms,
        settings.capture_timeout_secs
    );

    #[cfg(unix)]
    let socket_path = env::var("LOCKSHOT_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| app_data_dir.join("lockshot.sock"));
    #[cfg(unix)]
    spawn_feed_listener(
        socket_path.clone(),
        bus.clone(),
        monitor.clone(),
        persister.clone(),
    )?;
    #[cfg(not(unix))]
    log::warn!("No unlock feed on this platform; signals cannot be delivered");

    shutdown_signal(monitor).await;

    #[cfg(unix)]
    let _ = std::fs::remove_file(&socket_path);

    Ok(())
}
