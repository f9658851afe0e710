// Capture Orchestrator Service
// Turns unlock signals into a supervised acquire -> warm up -> capture ->
// persist -> release pipeline

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::camera::{AcquireError, CameraHandle, CameraManager, CaptureError, Frame};
use super::notifier::{Notifier, ServiceStatus};
use super::permissions::PermissionProbe;
use super::persister::ImagePersister;
use crate::models::{CameraFacing, CapturedImage, Visibility};

/// Pipeline stage of the in-flight session. Idle is encoded by the absence
/// of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Acquiring,
    Bound,
    Capturing,
    Saving,
    Releasing,
}

/// The single in-flight capture attempt. At most one exists at a time;
/// unlock signals arriving while it lives are dropped, not queued.
struct CaptureSession {
    id: u64,
    status: SessionStatus,
    handle: Option<CameraHandle>,
    started_at: Instant,
    stage_task: Option<JoinHandle<()>>,
}

/// Stage completions posted back to the event loop. Every event carries the
/// session id so a completion from a torn-down session cannot touch a newer
/// one.
enum StageEvent {
    Unlock,
    Acquired {
        session_id: u64,
        handle: CameraHandle,
    },
    AcquireFailed {
        session_id: u64,
        error: AcquireError,
    },
    WarmupElapsed {
        session_id: u64,
    },
    Captured {
        session_id: u64,
        frame: Frame,
    },
    CaptureFailed {
        session_id: u64,
        error: CaptureError,
    },
    Persisted {
        session_id: u64,
        image: CapturedImage,
    },
    PersistFailed {
        session_id: u64,
        error: String,
    },
    CancelSession,
    Shutdown,
}

/// Cheap cloneable entry point into the orchestrator's event loop
#[derive(Clone)]
pub struct OrchestratorHandle {
    events: mpsc::Sender<StageEvent>,
}

impl OrchestratorHandle {
    /// Trigger a capture attempt. Never blocks the caller; if the loop's
    /// inbox is full or gone the signal is dropped with a log line.
    pub fn on_unlock(&self) {
        if self.events.try_send(StageEvent::Unlock).is_err() {
            log::warn!("Unlock signal dropped, orchestrator not accepting events");
        }
    }

    /// Drop the in-flight session, if any, and free the camera. The loop
    /// keeps running and will serve the next unlock signal.
    pub fn cancel_session(&self) {
        if self.events.try_send(StageEvent::CancelSession).is_err() {
            log::debug!("Session cancel dropped, orchestrator not accepting events");
        }
    }

    /// Stop the event loop, tearing down any in-flight session
    pub async fn shutdown(&self) {
        let _ = self.events.send(StageEvent::Shutdown).await;
    }
}

/// Owns `CaptureSession` and all of its status transitions. Stage work runs
/// on spawned tasks that report back through typed events, so only the
/// event loop ever mutates session state.
pub struct CaptureOrchestrator {
    manager: Arc<CameraManager>,
    persister: Arc<ImagePersister>,
    notifier: Arc<dyn Notifier>,
    permissions: Arc<dyn PermissionProbe>,
    facing: CameraFacing,
    warmup_delay: Duration,
    events: mpsc::Sender<StageEvent>,
    inbox: mpsc::Receiver<StageEvent>,
    session: Option<CaptureSession>,
    next_session_id: u64,
}

impl CaptureOrchestrator {
    pub fn new(
        manager: Arc<CameraManager>,
        persister: Arc<ImagePersister>,
        notifier: Arc<dyn Notifier>,
        permissions: Arc<dyn PermissionProbe>,
        facing: CameraFacing,
        warmup_delay: Duration,
    ) -> Self {
        let (events, inbox) = mpsc::channel(64);
        Self {
            manager,
            persister,
            notifier,
            permissions,
            facing,
            warmup_delay,
            events,
            inbox,
            session: None,
            next_session_id: 0,
        }
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            events: self.events.clone(),
        }
    }

    /// Run the event loop until shutdown. Spawn this on the runtime.
    pub async fn run(mut self) {
        log::info!(
            "Capture orchestrator running ({} camera, {}ms warm-up)",
            self.facing,
            self.warmup_delay.as_millis()
        );

        while let Some(event) = self.inbox.recv().await {
            match event {
                StageEvent::Unlock => self.on_unlock_signal(),
                StageEvent::Acquired { session_id, handle } => {
                    self.on_acquired(session_id, handle)
                }
                StageEvent::AcquireFailed { session_id, error } => {
                    self.on_acquire_failed(session_id, error)
                }
                StageEvent::WarmupElapsed { session_id } => self.on_warmup_elapsed(session_id),
                StageEvent::Captured { session_id, frame } => self.on_captured(session_id, frame),
                StageEvent::CaptureFailed { session_id, error } => {
                    self.on_capture_failed(session_id, error)
                }
                StageEvent::Persisted { session_id, image } => {
                    self.on_persisted(session_id, image)
                }
                StageEvent::PersistFailed { session_id, error } => {
                    self.on_persist_failed(session_id, error)
                }
                StageEvent::CancelSession => self.cancel_session(),
                StageEvent::Shutdown => break,
            }
        }

        self.teardown();
        log::info!("Capture orchestrator stopped");
    }

    /// Take the session out of the loop if the event belongs to it. Events
    /// from sessions that already finished are dropped here.
    fn take_current(&mut self, session_id: u64) -> Option<CaptureSession> {
        match &self.session {
            Some(session) if session.id == session_id => self.session.take(),
            _ => {
                log::debug!("Ignoring stage event for finished session {}", session_id);
                None
            }
        }
    }

    /// Release the device and close out the session. Every exit path of the
    /// pipeline funnels through here so the handle can never leak.
    fn finish_session(&mut self, mut session: CaptureSession, failure: Option<String>) {
        session.status = SessionStatus::Releasing;
        self.manager.release(session.handle.take());

        match failure {
            Some(message) => self.notifier.post_status(&ServiceStatus::error(message)),
            None => log::info!(
                "Capture session {} completed in {}ms",
                session.id,
                session.started_at.elapsed().as_millis()
            ),
        }
        // dropping the session returns the orchestrator to idle
    }

    fn on_unlock_signal(&mut self) {
        if let Some(session) = &self.session {
            log::info!(
                "Unlock ignored, session {} in flight ({:?})",
                session.id,
                session.status
            );
            return;
        }

        if self.permissions.camera_status().blocks_capture() {
            log::warn!("Capture blocked: camera permission not granted");
            self.notifier.post_status(&ServiceStatus::PermissionRequired);
            return;
        }

        self.next_session_id += 1;
        let session_id = self.next_session_id;
        log::info!("Unlock received, starting capture session {}", session_id);

        let manager = self.manager.clone();
        let facing = self.facing;
        let events = self.events.clone();
        let stage_task = tokio::spawn(async move {
            // device discovery can shell out, so the capability check runs
            // on the blocking pool, never on the event loop
            let available = tokio::task::spawn_blocking({
                let manager = manager.clone();
                move || manager.has_camera(facing)
            })
            .await
            .unwrap_or(false);

            let event = if !available {
                StageEvent::AcquireFailed {
                    session_id,
                    error: AcquireError::Unavailable(facing),
                }
            } else {
                match manager.acquire(facing).await {
                    Ok(handle) => StageEvent::Acquired { session_id, handle },
                    Err(error) => StageEvent::AcquireFailed { session_id, error },
                }
            };
            let _ = events.send(event).await;
        });

        self.session = Some(CaptureSession {
            id: session_id,
            status: SessionStatus::Acquiring,
            handle: None,
            started_at: Instant::now(),
            stage_task: Some(stage_task),
        });
    }

    fn on_acquired(&mut self, session_id: u64, handle: CameraHandle) {
        let Some(mut session) = self.take_current(session_id) else {
            // the session is gone; don't leak the fresh binding
            self.manager.release(Some(handle));
            return;
        };

        session.status = SessionStatus::Bound;
        session.handle = Some(handle);

        let delay = self.warmup_delay;
        let events = self.events.clone();
        session.stage_task = Some(tokio::spawn(async move {
            // let auto-exposure settle before grabbing
            tokio::time::sleep(delay).await;
            let _ = events.send(StageEvent::WarmupElapsed { session_id }).await;
        }));

        self.session = Some(session);
    }

    fn on_acquire_failed(&mut self, session_id: u64, error: AcquireError) {
        let Some(session) = self.take_current(session_id) else {
            return;
        };
        log::error!("Capture session {} could not bind the camera: {}", session_id, error);
        self.finish_session(session, Some(error.to_string()));
    }

    fn on_warmup_elapsed(&mut self, session_id: u64) {
        let Some(mut session) = self.take_current(session_id) else {
            return;
        };
        let Some(handle) = session.handle else {
            self.finish_session(
                session,
                Some("Capture aborted: warm-up finished without a bound camera".to_string()),
            );
            return;
        };

        session.status = SessionStatus::Capturing;

        let manager = self.manager.clone();
        let events = self.events.clone();
        session.stage_task = Some(tokio::spawn(async move {
            let event = match manager.capture(handle).await {
                Ok(frame) => StageEvent::Captured { session_id, frame },
                Err(error) => StageEvent::CaptureFailed { session_id, error },
            };
            let _ = events.send(event).await;
        }));

        self.session = Some(session);
    }

    fn on_captured(&mut self, session_id: u64, frame: Frame) {
        let Some(mut session) = self.take_current(session_id) else {
            return;
        };

        session.status = SessionStatus::Saving;
        log::info!(
            "Capture session {} got a {}x{} frame after {}ms",
            session_id,
            frame.width,
            frame.height,
            frame.timestamp_ms
        );

        let persister = self.persister.clone();
        let events = self.events.clone();
        session.stage_task = Some(tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || -> Result<CapturedImage, String> {
                let mut image = persister.save(&frame).map_err(|e| e.to_string())?;
                if persister.publish_enabled() {
                    // publication is best-effort; the snapshot stays valid
                    match persister.publish(&image) {
                        Ok(_) => image.visibility = Visibility::Published,
                        Err(e) => log::warn!("Snapshot publication failed: {}", e),
                    }
                }
                Ok(image)
            })
            .await;

            let event = match outcome {
                Ok(Ok(image)) => StageEvent::Persisted { session_id, image },
                Ok(Err(error)) => StageEvent::PersistFailed { session_id, error },
                Err(e) => StageEvent::PersistFailed {
                    session_id,
                    error: format!("persist task failed: {e}"),
                },
            };
            let _ = events.send(event).await;
        }));

        self.session = Some(session);
    }

    fn on_capture_failed(&mut self, session_id: u64, error: CaptureError) {
        let Some(session) = self.take_current(session_id) else {
            return;
        };
        log::error!("Capture session {} failed: {}", session_id, error);
        self.finish_session(session, Some(error.to_string()));
    }

    fn on_persisted(&mut self, session_id: u64, image: CapturedImage) {
        let Some(session) = self.take_current(session_id) else {
            return;
        };
        log::info!(
            "Capture session {} stored {} ({:?})",
            session_id,
            image.file_path,
            image.visibility
        );
        self.finish_session(session, None);
    }

    fn on_persist_failed(&mut self, session_id: u64, error: String) {
        let Some(session) = self.take_current(session_id) else {
            return;
        };
        log::error!("Capture session {} could not store the frame: {}", session_id, error);
        self.finish_session(session, Some(error));
    }

    /// Drop the in-flight session and release its binding. Completion
    /// events from stages that still finish are fenced by session id, and
    /// the released generation keeps a late put-back of the device session
    /// from sticking.
    fn cancel_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            log::info!("Cancelling in-flight capture session {}", session.id);
            // an aborted half-finished open would wedge the device slot, so
            // the acquire stage always runs out
            if session.status != SessionStatus::Acquiring {
                if let Some(task) = session.stage_task.take() {
                    task.abort();
                }
            }
            session.status = SessionStatus::Releasing;
            self.manager.release(session.handle.take());
        }
    }

    /// Best-effort unwind on shutdown
    fn teardown(&mut self) {
        self.cancel_session();
        self.manager.release_all();
    }
}
