use crate::adapters::vault::{
    CancelCheck, VaultError, VaultFileMetadata, VaultProvider, VaultResult,
};
use crate::domain::identity::{IDENTITY_FILE_NAME, LEGACY_IDENTITY_FILE_NAME, VaultIdentity};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Vault backed by a directory tree on a mounted volume.
///
/// Object metadata is carried as extended attributes on the destination
/// files, written before the final rename so a key is either fully present
/// (bytes + attributes) or absent.
#[derive(Clone, Debug)]
pub struct LocalVault {
    root: PathBuf,
}

impl LocalVault {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a forward-slash key to a path under the vault root,
    /// rejecting traversal segments.
    fn resolve(&self, key: &str) -> VaultResult<PathBuf> {
        let mut path = self.root.clone();
        let mut any = false;
        for segment in key.split('/') {
            if segment.is_empty() {
                continue;
            }
            if segment == "." || segment == ".." {
                return Err(VaultError::Internal(format!("Refusing traversal segment in key: {key}")));
            }
            path.push(segment);
            any = true;
        }
        if !any {
            return Err(VaultError::Internal(format!("Empty key: {key}")));
        }
        Ok(path)
    }

    fn map_io(e: std::io::Error) -> VaultError {
        match e.kind() {
            std::io::ErrorKind::NotFound => VaultError::NotFound,
            std::io::ErrorKind::PermissionDenied => VaultError::PermissionDenied(e.to_string()),
            _ => VaultError::Io(e),
        }
    }
}

/// Extended-attribute name for a metadata key. Linux requires the `user.`
/// namespace; macOS takes the bare name.
fn xattr_name(key: &str) -> String {
    if cfg!(target_os = "linux") { format!("user.anchor.{key}") } else { format!("anchor.{key}") }
}

fn strip_xattr_name(name: &str) -> Option<&str> {
    name.strip_prefix("user.anchor.").or_else(|| name.strip_prefix("anchor."))
}

/// Writes one metadata entry as an extended attribute.
///
/// # Errors
/// Returns the underlying I/O error if the attribute cannot be written.
pub fn write_xattr(path: &Path, key: &str, value: &str) -> std::io::Result<()> {
    xattr::set(path, xattr_name(key), value.as_bytes())
}

/// Reads every `anchor.*` extended attribute into a metadata map.
///
/// # Errors
/// Returns the underlying I/O error if the listing fails.
pub fn read_xattrs(path: &Path) -> std::io::Result<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    for name in xattr::list(path)? {
        let Some(name_str) = name.to_str() else { continue };
        let Some(key) = strip_xattr_name(name_str) else { continue };
        if let Some(value) = xattr::get(path, &name)? {
            metadata.insert(key.to_string(), String::from_utf8_lossy(&value).into_owned());
        }
    }
    Ok(metadata)
}

#[async_trait]
impl VaultProvider for LocalVault {
    async fn load_identity(&self) -> VaultResult<Option<VaultIdentity>> {
        for name in [IDENTITY_FILE_NAME, LEGACY_IDENTITY_FILE_NAME] {
            match tokio::fs::read(self.root.join(name)).await {
                Ok(bytes) => {
                    let identity = serde_json::from_slice(&bytes)
                        .map_err(|e| VaultError::Internal(format!("Unreadable vault identity: {e}")))?;
                    return Ok(Some(identity));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Self::map_io(e)),
            }
        }
        Ok(None)
    }

    async fn save_identity(&self, identity: &VaultIdentity) -> VaultResult<()> {
        let bytes = serde_json::to_vec_pretty(identity)
            .map_err(|e| VaultError::Internal(format!("Failed to encode vault identity: {e}")))?;
        tokio::fs::create_dir_all(&self.root).await.map_err(Self::map_io)?;

        let dest = self.root.join(IDENTITY_FILE_NAME);
        let temp = self.root.join(format!(".{IDENTITY_FILE_NAME}.tmp"));
        tokio::fs::write(&temp, &bytes).await.map_err(Self::map_io)?;
        tokio::fs::rename(&temp, &dest).await.map_err(Self::map_io)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, metadata, cancel), err)]
    async fn save_file(
        &self,
        local_source: &Path,
        key: &str,
        metadata: &HashMap<String, String>,
        cancel: CancelCheck,
    ) -> VaultResult<()> {
        let dest = self.resolve(key)?;

        let size = tokio::fs::metadata(local_source).await.map_err(Self::map_io)?.len();
        let available = fs4::available_space(&self.root).map_err(Self::map_io)?;
        if available < size {
            return Err(VaultError::DiskFull { required: size, available });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Self::map_io)?;
        }

        if cancel() {
            return Err(VaultError::Cancelled);
        }

        // Copy to a hidden sibling and rename so `dest` is never half-written.
        let file_name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VaultError::Internal(format!("Key has no file name: {key}")))?;
        let temp = dest.with_file_name(format!(".{file_name}.anchor-tmp"));

        let result = async {
            tokio::fs::copy(local_source, &temp).await.map_err(Self::map_io)?;

            let temp_for_attrs = temp.clone();
            let attrs: Vec<(String, String)> = metadata.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            tokio::task::spawn_blocking(move || {
                for (k, v) in &attrs {
                    write_xattr(&temp_for_attrs, k, v)?;
                }
                Ok::<_, std::io::Error>(())
            })
            .await
            .map_err(|e| VaultError::Internal(e.to_string()))?
            .map_err(Self::map_io)?;

            if cancel() {
                return Err(VaultError::Cancelled);
            }

            if tokio::fs::metadata(&dest).await.is_ok() {
                tokio::fs::remove_file(&dest).await.map_err(Self::map_io)?;
            }
            tokio::fs::rename(&temp, &dest).await.map_err(Self::map_io)?;
            Ok(())
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp).await;
        }
        result
    }

    async fn delete_file(&self, key: &str) -> VaultResult<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::map_io(e)),
        }
    }

    async fn move_item(&self, old_key: &str, new_key: &str) -> VaultResult<()> {
        let old = self.resolve(old_key)?;
        let new = self.resolve(new_key)?;
        if let Some(parent) = new.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Self::map_io)?;
        }
        tokio::fs::rename(&old, &new).await.map_err(Self::map_io)?;
        Ok(())
    }

    async fn file_exists(&self, key: &str) -> VaultResult<bool> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    async fn get_metadata(&self, key: &str) -> VaultResult<HashMap<String, String>> {
        let path = self.resolve(key)?;
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(VaultError::NotFound);
        }
        tokio::task::spawn_blocking(move || read_xattrs(&path))
            .await
            .map_err(|e| VaultError::Internal(e.to_string()))?
            .map_err(Self::map_io)
    }

    async fn list_files(&self, prefix: &str) -> VaultResult<Vec<VaultFileMetadata>> {
        let dir = if prefix.is_empty() { self.root.clone() } else { self.resolve(prefix)? };
        let mut entries = Vec::new();

        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(Self::map_io(e)),
        };

        while let Some(entry) = reader.next_entry().await.map_err(Self::map_io)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().await.map_err(Self::map_io)?;
            let path = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
            entries.push(VaultFileMetadata {
                name,
                path,
                is_folder: meta.is_dir(),
                size: meta.len(),
                modified: meta.modified().ok().map(OffsetDateTime::from),
            });
        }
        Ok(entries)
    }

    async fn list_all_files(&self) -> VaultResult<Vec<String>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            let walker = walkdir::WalkDir::new(&root).into_iter().filter_entry(|e| {
                e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.')
            });
            for entry in walker {
                let entry = entry.map_err(|e| VaultError::Internal(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&root) {
                    keys.push(rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"));
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| VaultError::Internal(e.to_string()))?
    }

    async fn wipe(&self, prefix: &str) -> VaultResult<()> {
        if prefix.is_empty() {
            let mut reader = match tokio::fs::read_dir(&self.root).await {
                Ok(r) => r,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(Self::map_io(e)),
            };
            while let Some(entry) = reader.next_entry().await.map_err(Self::map_io)? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == IDENTITY_FILE_NAME || name == LEGACY_IDENTITY_FILE_NAME {
                    continue;
                }
                let meta = entry.metadata().await.map_err(Self::map_io)?;
                let result = if meta.is_dir() {
                    tokio::fs::remove_dir_all(entry.path()).await
                } else {
                    tokio::fs::remove_file(entry.path()).await
                };
                result.map_err(Self::map_io)?;
            }
            return Ok(());
        }

        let dir = self.resolve(prefix)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::map_io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_keys() {
        let vault = LocalVault::new("/tmp/vault");
        assert!(vault.resolve("a/../b").is_err());
        assert!(vault.resolve("..").is_err());
        assert!(vault.resolve("").is_err());
        assert!(vault.resolve("a//b").is_ok());
    }

    #[test]
    fn xattr_names_are_namespaced() {
        let name = xattr_name("original-sha256");
        assert!(name.ends_with("anchor.original-sha256"));
        assert_eq!(strip_xattr_name(&name), Some("original-sha256"));
    }
}
