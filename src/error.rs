use thiserror::Error;

/// Failure taxonomy for the backup core.
///
/// `Cancelled` is not a user-facing failure: it never increments a file's
/// failure count and never produces a notification.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Recoverable provider/network failure; retried on the next event or scan tick.
    #[error("Transient error: {0}")]
    Transient(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Destination full: need {required} bytes, {available} available")]
    DiskFull { required: u64, available: u64 },
    #[error("Invalid vault password")]
    InvalidPassword,
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Ledger is corrupt and was reset")]
    CorruptLedger,
    #[error("Provider error: {0}")]
    Provider(String),
    #[error("Ledger error: {0}")]
    Ledger(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// True for failures worth retrying on a later event or scan tick.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Provider(_) | Self::Io(_) | Self::Ledger(_))
    }
}
