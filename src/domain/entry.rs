use time::OffsetDateTime;

/// Verification lifecycle of a vaulted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyState {
    Pending,
    Verified,
    Mismatch,
    MissingMetadata,
}

impl std::fmt::Display for VerifyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Verified => write!(f, "verified"),
            Self::Mismatch => write!(f, "mismatch"),
            Self::MissingMetadata => write!(f, "missing-metadata"),
        }
    }
}

impl std::str::FromStr for VerifyState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "verified" => Ok(Self::Verified),
            "mismatch" => Ok(Self::Mismatch),
            "missing-metadata" => Ok(Self::MissingMetadata),
            _ => Err(format!("Invalid verify state: {s}")),
        }
    }
}

/// One tracked file in the ledger, keyed by its logical relative path.
///
/// Paths are case-preserving and compared case-sensitively; a change in case
/// is a rename as far as the ledger is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub gen_id: String,
    pub content_hash: String,
    pub failure_count: i64,
    pub verify_state: VerifyState,
    pub verify_at: Option<OffsetDateTime>,
}

/// A multipart upload that has been started but not yet completed or aborted.
/// Keyed by the vault-side object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEntry {
    pub object_key: String,
    pub upload_id: String,
    pub started_at: OffsetDateTime,
}

/// Consecutive failures after which a path is quarantined until an operator reset.
pub const MAX_FAILURES: i64 = 3;
