use std::collections::HashSet;
use std::path::Path;
use std::sync::RwLock;

/// Path components that are never backed up.
const SYSTEM_COMPONENTS: &[&str] =
    &[".git", ".DS_Store", "node_modules", "__MACOSX", "Thumbs.db", "Desktop.ini", ".svn"];

/// Extensions of scratch files that are never backed up.
const SYSTEM_EXTENSIONS: &[&str] = &["tmp", "temp", "swp", "lock"];

/// Decides whether a path participates in backup. Performs no I/O.
#[derive(Debug)]
pub struct ExclusionFilter {
    user_components: HashSet<String>,
    user_extensions: HashSet<String>,
    /// Absolute path prefixes excluded until further notice.
    temporary_prefixes: RwLock<HashSet<String>>,
}

impl ExclusionFilter {
    #[must_use]
    pub fn new(user_components: impl IntoIterator<Item = String>, user_extensions: impl IntoIterator<Item = String>) -> Self {
        Self {
            user_components: user_components.into_iter().collect(),
            user_extensions: user_extensions.into_iter().map(|e| e.to_ascii_lowercase()).collect(),
            temporary_prefixes: RwLock::new(HashSet::new()),
        }
    }

    /// True if `path` must be skipped.
    #[must_use]
    pub fn should_ignore(&self, path: &Path) -> bool {
        for component in path.components() {
            let Some(name) = component.as_os_str().to_str() else { continue };
            if SYSTEM_COMPONENTS.contains(&name) || self.user_components.contains(name) {
                return true;
            }
        }

        if let Some(basename) = path.file_name().and_then(|n| n.to_str())
            && basename.starts_with("~$")
        {
            return true;
        }

        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            let ext = ext.to_ascii_lowercase();
            if SYSTEM_EXTENSIONS.contains(&ext.as_str()) || self.user_extensions.contains(&ext) {
                return true;
            }
        }

        if let Ok(prefixes) = self.temporary_prefixes.read() {
            let path_str = path.to_string_lossy();
            if prefixes.iter().any(|p| path_str.starts_with(p.as_str())) {
                return true;
            }
        }

        false
    }

    pub fn exclude_prefix(&self, prefix: impl Into<String>) {
        if let Ok(mut prefixes) = self.temporary_prefixes.write() {
            prefixes.insert(prefix.into());
        }
    }

    pub fn restore_prefix(&self, prefix: &str) {
        if let Ok(mut prefixes) = self.temporary_prefixes.write() {
            prefixes.remove(prefix);
        }
    }
}

impl Default for ExclusionFilter {
    fn default() -> Self {
        Self::new(std::iter::empty(), std::iter::empty())
    }
}
