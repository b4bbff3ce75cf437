use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// One exportable representation of an asset (original or derivative).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoResource {
    pub file_name: String,
}

/// A photo-library asset and the resources it yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoAsset {
    pub identifier: String,
    pub created_at: OffsetDateTime,
    pub resources: Vec<PhotoResource>,
}

/// Assets inserted since a change token, plus the library's current token.
#[derive(Debug, Clone)]
pub struct PhotoChanges {
    pub assets: Vec<PhotoAsset>,
    pub token: String,
}

/// Boundary to the host photo library. The enumeration machinery is an
/// external collaborator; the core only consumes inserted-asset batches and
/// exports their resources.
#[async_trait]
pub trait PhotoLibrary: Send + Sync + 'static {
    /// Assets inserted since `token`. A `None` token requests a full
    /// library scan; the returned token captures the library state at the
    /// end of that enumeration.
    async fn changes_since(&self, token: Option<&str>) -> Result<PhotoChanges>;

    /// Exports one resource of `asset` into `dest_dir`, returning the
    /// exported file's path.
    async fn export_resource(
        &self,
        asset: &PhotoAsset,
        resource: &PhotoResource,
        dest_dir: &Path,
    ) -> Result<PathBuf>;
}
