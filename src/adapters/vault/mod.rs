use crate::domain::identity::VaultIdentity;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;

pub mod local;
pub mod s3;

pub use local::LocalVault;
pub use s3::S3Vault;

/// User metadata key carrying the lowercase hex SHA-256 of the plaintext.
pub const METADATA_HASH_KEY: &str = "original-sha256";

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Destination full: need {required} bytes, {available} available")]
    DiskFull { required: u64, available: u64 },
    #[error("Object not found")]
    NotFound,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal vault error: {0}")]
    Internal(String),
}

pub type VaultResult<T> = Result<T, VaultError>;

impl From<VaultError> for crate::error::AgentError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::DiskFull { required, available } => Self::DiskFull { required, available },
            VaultError::Cancelled => Self::Cancelled,
            VaultError::PermissionDenied(msg) => Self::PermissionDenied(msg),
            VaultError::NotFound | VaultError::Internal(_) => Self::Provider(e.to_string()),
            VaultError::Io(io) => Self::Io(io),
        }
    }
}

/// Polled by long transfers before each unit of work; returning true makes
/// the provider abandon the operation with [`VaultError::Cancelled`].
pub type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// A cancel check that never fires, for callers without a cancellation source.
#[must_use]
pub fn never_cancelled() -> CancelCheck {
    Arc::new(|| false)
}

/// One entry of a shallow vault listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultFileMetadata {
    pub name: String,
    pub path: String,
    pub is_folder: bool,
    pub size: u64,
    pub modified: Option<OffsetDateTime>,
}

/// Uniform file operations over a mounted directory or an S3 bucket.
#[async_trait]
pub trait VaultProvider: Send + Sync + 'static {
    /// Reads the vault identity marker. `None` means first use.
    async fn load_identity(&self) -> VaultResult<Option<VaultIdentity>>;

    async fn save_identity(&self, identity: &VaultIdentity) -> VaultResult<()>;

    /// Stores `local_source` under `key` with the given user metadata.
    /// Implementations must never leave a half-written object at `key`.
    async fn save_file(
        &self,
        local_source: &Path,
        key: &str,
        metadata: &HashMap<String, String>,
        cancel: CancelCheck,
    ) -> VaultResult<()>;

    async fn delete_file(&self, key: &str) -> VaultResult<()>;

    /// Aborts a resumable upload previously recorded under `key`. Providers
    /// without resumable uploads treat this as a no-op, and an abort for an
    /// id the backend no longer knows counts as success.
    async fn abort_upload(&self, _key: &str, _upload_id: &str) -> VaultResult<()> {
        Ok(())
    }

    async fn move_item(&self, old_key: &str, new_key: &str) -> VaultResult<()>;

    async fn file_exists(&self, key: &str) -> VaultResult<bool>;

    async fn get_metadata(&self, key: &str) -> VaultResult<HashMap<String, String>>;

    /// Shallow listing under `prefix`.
    async fn list_files(&self, prefix: &str) -> VaultResult<Vec<VaultFileMetadata>>;

    /// Full recursive enumeration of object keys.
    async fn list_all_files(&self) -> VaultResult<Vec<String>>;

    /// Deletes everything under `prefix`, always preserving the identity file.
    async fn wipe(&self, prefix: &str) -> VaultResult<()>;
}
