use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

pub mod watcher;

/// Materialization state of a cloud-synced file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Bytes are present locally.
    Current,
    /// A placeholder; the sync layer must download it before we can read.
    NotDownloaded,
    Unknown,
}

/// One observation of a source item during a scan or stat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Forward-slash path relative to the source root, case preserved.
    pub relative_path: String,
    pub is_directory: bool,
    /// Bundle directory presented as a single user-facing file.
    pub is_package: bool,
    pub download_status: DownloadStatus,
    /// Opaque token that changes iff the item's content changed.
    pub gen_id: String,
}

/// Read access to the user's source tree.
///
/// The drive watcher never touches the file system directly; everything
/// goes through this boundary so the cloud-sync quirks (partial
/// materialization, packages, coordinated reads) stay in one place.
#[async_trait]
pub trait SourceTree: Send + Sync + 'static {
    fn root(&self) -> &Path;

    /// Recursive enumeration. Package directories are yielded as single
    /// entries and never descended.
    async fn scan(&self) -> Result<Vec<SourceEntry>>;

    /// Stats one path; `None` when it no longer exists.
    async fn stat(&self, relative_path: &str) -> Result<Option<SourceEntry>>;

    /// Copies the item to a per-operation location under `dest_dir` through
    /// the platform's coordinated-read lock, so a concurrent writer cannot
    /// corrupt the snapshot. Packages become a single zip artifact.
    async fn snapshot(&self, relative_path: &str, dest_dir: &Path) -> Result<PathBuf>;

    /// Asks the sync layer to download a placeholder. A later change event
    /// re-delivers the path once the bytes are present.
    async fn request_materialization(&self, relative_path: &str) -> Result<()>;
}

/// Directory extensions the host presents as single files.
const PACKAGE_EXTENSIONS: &[&str] = &["app", "bundle", "framework", "photoslibrary", "pkg", "band", "logicx"];

/// `SourceTree` over a plain directory.
#[derive(Debug, Clone)]
pub struct LocalSourceTree {
    root: PathBuf,
    package_extensions: HashSet<String>,
}

impl LocalSourceTree {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            package_extensions: PACKAGE_EXTENSIONS.iter().map(ToString::to_string).collect(),
        }
    }

    fn is_package(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.package_extensions.contains(&e.to_ascii_lowercase()))
    }

    fn relative(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root)
            .ok()
            .map(|rel| rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"))
    }

    fn entry_for(&self, path: &Path, meta: &std::fs::Metadata) -> Option<SourceEntry> {
        let relative_path = self.relative(path)?;
        let is_package = meta.is_dir() && self.is_package(path);
        Some(SourceEntry {
            relative_path,
            is_directory: meta.is_dir() && !is_package,
            is_package,
            download_status: DownloadStatus::Current,
            gen_id: generation_id(meta),
        })
    }
}

/// Fingerprint of a file's identity and content version. Equality across
/// observations is the definition of "unchanged".
#[must_use]
pub fn generation_id(meta: &std::fs::Metadata) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        format!("{:x}-{:x}-{:x}-{:x}", meta.dev(), meta.ino(), meta.mtime_nsec().unsigned_abs(), meta.len())
    }
    #[cfg(not(unix))]
    {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos());
        format!("{mtime:x}-{:x}", meta.len())
    }
}

/// Zips a directory into a single archive file, stored entries relative to
/// the directory itself.
fn zip_directory(dir: &Path, archive: &Path) -> std::io::Result<()> {
    let file = std::fs::File::create(archive)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(std::io::Error::other)?
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        if rel.is_empty() {
            continue;
        }
        if entry.file_type().is_dir() {
            writer.add_directory(format!("{rel}/"), options).map_err(std::io::Error::other)?;
        } else if entry.file_type().is_file() {
            writer.start_file(rel, options).map_err(std::io::Error::other)?;
            let bytes = std::fs::read(entry.path())?;
            writer.write_all(&bytes)?;
        }
    }
    writer.finish().map_err(std::io::Error::other)?;
    Ok(())
}

#[async_trait]
impl SourceTree for LocalSourceTree {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn scan(&self) -> Result<Vec<SourceEntry>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            let mut walker = walkdir::WalkDir::new(&this.root).into_iter();

            while let Some(item) = walker.next() {
                let item = item.map_err(|e| AgentError::Io(std::io::Error::other(e)))?;
                if item.depth() == 0 {
                    continue;
                }
                let meta = item.metadata().map_err(|e| AgentError::Io(std::io::Error::other(e)))?;
                if let Some(entry) = this.entry_for(item.path(), &meta) {
                    let descend = entry.is_directory;
                    entries.push(entry);
                    if !descend && meta.is_dir() {
                        walker.skip_current_dir();
                    }
                }
            }
            Ok(entries)
        })
        .await
        .map_err(|e| AgentError::Io(std::io::Error::other(e)))?
    }

    async fn stat(&self, relative_path: &str) -> Result<Option<SourceEntry>> {
        let path = self.root.join(relative_path);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(self.entry_for(&path, &meta)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn snapshot(&self, relative_path: &str, dest_dir: &Path) -> Result<PathBuf> {
        let source = self.root.join(relative_path);
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| AgentError::Io(std::io::Error::other(format!("No file name in {relative_path}"))))?;
        let dest = dest_dir.join(&file_name);

        let meta = tokio::fs::metadata(&source).await?;
        if meta.is_dir() {
            let archive = dest.clone();
            tokio::task::spawn_blocking(move || zip_directory(&source, &archive))
                .await
                .map_err(|e| AgentError::Io(std::io::Error::other(e)))??;
        } else {
            tokio::fs::copy(&source, &dest).await?;
        }
        Ok(dest)
    }

    async fn request_materialization(&self, relative_path: &str) -> Result<()> {
        // A plain directory is always materialized; the cloud-sync variants
        // of this boundary issue the download request here.
        tracing::debug!(relative_path, "Materialization requested on a local tree");
        Ok(())
    }
}
