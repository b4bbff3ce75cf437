use crate::domain::events::{BackupSurface, NetworkState, StatusEvent, WatcherState};
use serde::Serialize;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
struct States {
    drive: WatcherState,
    photos: WatcherState,
    network: NetworkState,
    paused: bool,
}

/// Aggregated agent state for UI collaborators.
///
/// Workers publish typed [`StatusEvent`]s; the registry folds them into the
/// snapshot served by the metrics endpoint and re-broadcasts them to
/// subscribers. Nothing else in the core holds UI-visible mutable state.
#[derive(Debug)]
pub struct StatusRegistry {
    events: broadcast::Sender<StatusEvent>,
    files_vaulted: AtomicU64,
    photos_backed_up: AtomicU64,
    integrity_verified: AtomicU64,
    integrity_errors: AtomicU64,
    files_pending: AtomicU64,
    states: RwLock<States>,
}

/// JSON document served at `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub status: String,
    pub files_pending: u64,
    pub integrity_health: String,
    pub drive_status: String,
    pub photos_status: String,
    pub files_vaulted: u64,
    pub photos_backed_up: u64,
    pub integrity_verified: u64,
    pub integrity_errors: u64,
    pub network_status: String,
    pub is_paused: bool,
    pub hostname: String,
    pub app_version: String,
    pub timestamp: i64,
}

impl StatusRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            files_vaulted: AtomicU64::new(0),
            photos_backed_up: AtomicU64::new(0),
            integrity_verified: AtomicU64::new(0),
            integrity_errors: AtomicU64::new(0),
            files_pending: AtomicU64::new(0),
            states: RwLock::new(States {
                drive: WatcherState::Idle,
                photos: WatcherState::Idle,
                network: NetworkState::Disconnected,
                paused: false,
            }),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Folds an event into the snapshot and re-broadcasts it.
    pub fn publish(&self, event: StatusEvent) {
        match &event {
            StatusEvent::WatcherState { surface, state } => {
                if let Ok(mut states) = self.states.write() {
                    match surface {
                        BackupSurface::Drive => states.drive = *state,
                        BackupSurface::Photos => states.photos = *state,
                    }
                }
            }
            StatusEvent::Network(state) => {
                if let Ok(mut states) = self.states.write() {
                    states.network = *state;
                }
            }
            StatusEvent::Paused(paused) => {
                if let Ok(mut states) = self.states.write() {
                    states.paused = *paused;
                }
            }
            StatusEvent::FileVaulted { surface } => {
                match surface {
                    BackupSurface::Drive => self.files_vaulted.fetch_add(1, Ordering::Relaxed),
                    BackupSurface::Photos => self.photos_backed_up.fetch_add(1, Ordering::Relaxed),
                };
            }
            StatusEvent::VerifyMismatch { .. } => {
                self.integrity_errors.fetch_add(1, Ordering::Relaxed);
            }
            StatusEvent::LedgerReset => {}
        }

        // No subscribers is fine; the snapshot still advanced.
        let _ = self.events.send(event);
    }

    pub fn record_verified(&self) {
        self.integrity_verified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pending(&self, count: u64) {
        self.files_pending.store(count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (drive, photos, network, paused) = self.states.read().map_or(
            (WatcherState::Idle, WatcherState::Idle, NetworkState::Disconnected, false),
            |s| (s.drive, s.photos, s.network, s.paused),
        );

        let integrity_errors = self.integrity_errors.load(Ordering::Relaxed);
        let status = if paused {
            "paused"
        } else if matches!(drive, WatcherState::Scanning | WatcherState::Vaulting)
            || matches!(photos, WatcherState::Scanning | WatcherState::Vaulting)
        {
            "backing-up"
        } else {
            "idle"
        };

        MetricsSnapshot {
            status: status.to_string(),
            files_pending: self.files_pending.load(Ordering::Relaxed),
            integrity_health: if integrity_errors == 0 { "ok".to_string() } else { "degraded".to_string() },
            drive_status: drive.to_string(),
            photos_status: photos.to_string(),
            files_vaulted: self.files_vaulted.load(Ordering::Relaxed),
            photos_backed_up: self.photos_backed_up.load(Ordering::Relaxed),
            integrity_verified: self.integrity_verified.load(Ordering::Relaxed),
            integrity_errors,
            network_status: network.to_string(),
            is_paused: paused,
            hostname: hostname::get().map_or_else(|_| "unknown".to_string(), |h| h.to_string_lossy().into_owned()),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new()
    }
}
