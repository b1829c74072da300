//! Latest telemetry reading plus connectivity flag.

use parking_lot::RwLock;
use shared::types::SystemStats;
use tokio::sync::watch;

struct Inner {
    stats: Option<SystemStats>,
    connected: bool,
}

/// Single current system snapshot. Each telemetry push replaces the
/// reading wholesale; no history is kept and no fields are merged.
pub struct SystemStatus {
    inner: RwLock<Inner>,
    changed_tx: watch::Sender<u64>,
}

impl SystemStatus {
    pub fn new() -> Self {
        let (changed_tx, _) = watch::channel(0);
        Self {
            inner: RwLock::new(Inner {
                stats: None,
                connected: false,
            }),
            changed_tx,
        }
    }

    pub fn replace_stats(&self, stats: SystemStats) {
        self.inner.write().stats = Some(stats);
        self.notify();
    }

    pub fn set_connected(&self, connected: bool) {
        {
            let mut inner = self.inner.write();
            if inner.connected == connected {
                return;
            }
            inner.connected = connected;
        }
        self.notify();
    }

    pub fn connected(&self) -> bool {
        self.inner.read().connected
    }

    pub fn stats(&self) -> Option<SystemStats> {
        self.inner.read().stats.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed_tx.subscribe()
    }

    fn notify(&self) {
        self.changed_tx.send_modify(|generation| *generation += 1);
    }
}

impl Default for SystemStatus {
    fn default() -> Self {
        Self::new()
    }
}
