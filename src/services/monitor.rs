// Monitor Service
// Start/stop lifecycle around the unlock listener and the orchestrator

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::notifier::{Notifier, ServiceStatus};
use super::orchestrator::OrchestratorHandle;
use super::unlock::{UnlockBus, UnlockSignal};

#[derive(Default)]
struct RunState {
    registered: bool,
    listener: Option<JoinHandle<()>>,
}

/// Owns the daemon's running state: whether an unlock listener is
/// registered and forwarding signals into the orchestrator. Start and stop
/// are idempotent; stopping also drops any in-flight capture session.
pub struct MonitorService {
    bus: UnlockBus,
    orchestrator: OrchestratorHandle,
    notifier: Arc<dyn Notifier>,
    state: Mutex<RunState>,
}

impl MonitorService {
    pub fn new(bus: UnlockBus, orchestrator: OrchestratorHandle, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            bus,
            orchestrator,
            notifier,
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().registered
    }

    /// Register the unlock listener and mark the service active. No-op when
    /// already running.
    pub fn start(&self) {
        let mut state = self.lock_state();
        if state.registered {
            log::info!("Monitor already running");
            return;
        }

        let mut signals = self.bus.subscribe();
        let orchestrator = self.orchestrator.clone();
        state.listener = Some(tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(UnlockSignal::Unlocked) => orchestrator.on_unlock(),
                    Ok(UnlockSignal::ScreenOn) => {
                        log::debug!("Screen-on signal observed, no capture")
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("Unlock listener lagged, {} signals missed", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
        state.registered = true;
        drop(state);

        self.notifier.post_status(&ServiceStatus::Active);
        log::info!("Monitor started, listening for unlock signals");
    }

    /// Unregister the unlock listener and cancel any in-flight session.
    /// Stopping an already-stopped monitor only logs.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        if !state.registered {
            log::info!("Monitor stop requested but no listener is registered");
            return;
        }

        if let Some(listener) = state.listener.take() {
            listener.abort();
        }
        state.registered = false;
        drop(state);

        self.orchestrator.cancel_session();
        log::info!("Monitor stopped");
    }

    /// Process-exit teardown: stop listening and end the orchestrator loop
    pub async fn shutdown(&self) {
        self.stop();
        self.orchestrator.shutdown().await;
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CameraFacing;
    use crate::services::camera::mock::MockBackend;
    use crate::services::camera::CameraManager;
    use crate::services::orchestrator::CaptureOrchestrator;
    use crate::services::permissions::{PermissionProbe, PermissionStatus};
    use crate::services::persister::ImagePersister;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingNotifier {
        statuses: Mutex<Vec<ServiceStatus>>,
    }

    impl RecordingNotifier {
        fn statuses(&self) -> Vec<ServiceStatus> {
            self.statuses.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn post_status(&self, status: &ServiceStatus) {
            self.statuses.lock().unwrap().push(status.clone());
        }
    }

    struct GrantedProbe;

    impl PermissionProbe for GrantedProbe {
        fn camera_status(&self) -> PermissionStatus {
            PermissionStatus::Granted
        }
    }

    struct Harness {
        backend: Arc<MockBackend>,
        bus: UnlockBus,
        monitor: MonitorService,
        notifier: Arc<RecordingNotifier>,
        _dir: tempfile::TempDir,
    }

    fn spawn_monitor(warmup: Duration) -> Harness {
        let backend = Arc::new(MockBackend::new());
        let manager = Arc::new(CameraManager::new(
            backend.clone(),
            Duration::from_millis(250),
        ));
        let dir = tempfile::tempdir().unwrap();
        let persister = Arc::new(
            ImagePersister::new(
                dir.path().join("snapshots"),
                dir.path().join("fallback"),
                None,
                85,
            )
            .unwrap(),
        );
        let notifier = Arc::new(RecordingNotifier::default());

        let orchestrator = CaptureOrchestrator::new(
            manager,
            persister,
            notifier.clone(),
            Arc::new(GrantedProbe),
            CameraFacing::Front,
            warmup,
        );
        let handle = orchestrator.handle();
        tokio::spawn(orchestrator.run());

        let bus = UnlockBus::new();
        let monitor = MonitorService::new(bus.clone(), handle, notifier.clone());

        Harness {
            backend,
            bus,
            monitor,
            notifier,
            _dir: dir,
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..150 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_posts_active_once() {
        let h = spawn_monitor(Duration::from_millis(10));

        assert!(!h.monitor.is_running());
        h.monitor.start();
        h.monitor.start();

        assert!(h.monitor.is_running());
        assert_eq!(h.notifier.statuses(), vec![ServiceStatus::Active]);
    }

    #[tokio::test]
    async fn test_stop_without_start_does_not_fail() {
        let h = spawn_monitor(Duration::from_millis(10));

        h.monitor.stop();
        h.monitor.stop();

        assert!(!h.monitor.is_running());
        assert!(h.notifier.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_unlocked_signal_triggers_capture() {
        let h = spawn_monitor(Duration::from_millis(10));
        h.monitor.start();

        h.bus.publish(UnlockSignal::Unlocked);
        wait_for(|| h.backend.closes() == 1).await;

        assert_eq!(h.backend.grabs(), 1);
    }

    #[tokio::test]
    async fn test_screen_on_signal_is_dropped() {
        let h = spawn_monitor(Duration::from_millis(10));
        h.monitor.start();

        h.bus.publish(UnlockSignal::ScreenOn);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(h.backend.opens(), 0);
    }

    #[tokio::test]
    async fn test_stop_unregisters_the_listener() {
        let h = spawn_monitor(Duration::from_millis(10));
        h.monitor.start();
        h.monitor.stop();
        assert!(!h.monitor.is_running());

        h.bus.publish(UnlockSignal::Unlocked);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(h.backend.opens(), 0);
    }

    #[tokio::test]
    async fn test_restart_after_stop_listens_again() {
        let h = spawn_monitor(Duration::from_millis(10));
        h.monitor.start();
        h.monitor.stop();
        h.monitor.start();

        h.bus.publish(UnlockSignal::Unlocked);
        wait_for(|| h.backend.closes() == 1).await;

        assert_eq!(
            h.notifier.statuses(),
            vec![ServiceStatus::Active, ServiceStatus::Active]
        );
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_session() {
        let h = spawn_monitor(Duration::from_millis(500));
        h.monitor.start();

        h.bus.publish(UnlockSignal::Unlocked);
        wait_for(|| h.backend.opens() == 1).await;

        // the session is still in its warm-up window
        h.monitor.stop();
        wait_for(|| h.backend.closes() == 1).await;

        assert_eq!(h.backend.grabs(), 0);
    }
}
