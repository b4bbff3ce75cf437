use std::path::PathBuf;

/// File-system observations delivered to the drive watcher.
///
/// Produced by an OS-level notification source; the watcher owns all state
/// and treats these as the only way changes enter the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Appeared(PathBuf),
    Changed(PathBuf),
    Deleted(PathBuf),
    Moved { from: PathBuf, to: PathBuf },
}

impl SourceEvent {
    /// The path the event should be debounced under.
    #[must_use]
    pub fn primary_path(&self) -> &PathBuf {
        match self {
            Self::Appeared(p) | Self::Changed(p) | Self::Deleted(p) => p,
            Self::Moved { to, .. } => to,
        }
    }
}

/// Externally observable state of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Disabled,
    WaitingForVault,
    Scanning,
    Active,
    Monitoring,
    Downloading,
    Vaulting,
    Deleted,
    Paused,
}

impl std::fmt::Display for WatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Disabled => "disabled",
            Self::WaitingForVault => "waiting-for-vault",
            Self::Scanning => "scanning",
            Self::Active => "active",
            Self::Monitoring => "monitoring",
            Self::Downloading => "downloading",
            Self::Vaulting => "vaulting",
            Self::Deleted => "deleted",
            Self::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

/// Link state as tracked by the network monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Disconnected,
    Connected,
    Verified,
    CaptivePortal,
}

impl std::fmt::Display for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Verified => "verified",
            Self::CaptivePortal => "captive-portal",
        };
        write!(f, "{s}")
    }
}

/// Category attached to user-facing alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertCategory {
    BackupComplete,
    VaultIssue,
}

/// Which backup surface an event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupSurface {
    Drive,
    Photos,
}

impl std::fmt::Display for BackupSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drive => write!(f, "drive"),
            Self::Photos => write!(f, "photos"),
        }
    }
}

/// Typed status stream consumed by UI collaborators; no shared mutable UI
/// state lives in the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    WatcherState { surface: BackupSurface, state: WatcherState },
    Network(NetworkState),
    LedgerReset,
    Paused(bool),
    FileVaulted { surface: BackupSurface },
    VerifyMismatch { path: String },
}

/// Webhook event classes delivered to the optional collaborator endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEvent {
    BackupComplete,
    BackupFailed,
    VaultIssue,
    IntegrityMismatch,
    IntegrityError,
    Test,
}

impl WebhookEvent {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BackupComplete => "backup_complete",
            Self::BackupFailed => "backup_failed",
            Self::VaultIssue => "vault_issue",
            Self::IntegrityMismatch => "integrity_mismatch",
            Self::IntegrityError => "integrity_error",
            Self::Test => "test",
        }
    }
}
