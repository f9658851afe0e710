// Unlock Signal Bus
// In-process feed of lock-state events from the host system

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lock-state transitions the daemon listens for. Only `Unlocked` triggers a
/// capture; `ScreenOn` is accepted from feeders but dropped by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnlockSignal {
    Unlocked,
    ScreenOn,
}

impl UnlockSignal {
    /// Parse one line of the unlock feed protocol
    pub fn parse(line: &str) -> Option<UnlockSignal> {
        match line.trim().to_lowercase().as_str() {
            "unlocked" | "user-present" => Some(UnlockSignal::Unlocked),
            "screen-on" => Some(UnlockSignal::ScreenOn),
            _ => None,
        }
    }
}

/// Broadcast bus connecting signal feeders (the socket listener) to the
/// monitor's registered listener task
#[derive(Clone)]
pub struct UnlockBus {
    sender: broadcast::Sender<UnlockSignal>,
}

impl UnlockBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn publish(&self, signal: UnlockSignal) {
        if self.sender.send(signal).is_err() {
            log::debug!("Unlock signal {:?} dropped, no listener registered", signal);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UnlockSignal> {
        self.sender.subscribe()
    }
}

impl Default for UnlockBus {
    fn default() -> Self {
        Self::new()
    }
}
