use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Characters sent to the object store verbatim; everything else is
/// percent-encoded per component.
const KEY_KEEP: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'(')
    .remove(b')')
    .remove(b' ');

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Path traversal segment in key: {0}")]
    Traversal(String),
    #[error("Key has no usable segments")]
    Empty,
}

/// Builds a vault object key from a relative path.
///
/// Segments equal to `.` or `..` are rejected, empty segments collapsed,
/// and unsafe characters percent-encoded component-wise. The input always
/// uses forward slashes regardless of platform.
pub fn sanitize_key(relative_path: &str) -> Result<String, KeyError> {
    let mut segments = Vec::new();
    for segment in relative_path.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segment == "." || segment == ".." {
            return Err(KeyError::Traversal(relative_path.to_string()));
        }
        segments.push(utf8_percent_encode(segment, KEY_KEEP).to_string());
    }
    if segments.is_empty() {
        return Err(KeyError::Empty);
    }
    Ok(segments.join("/"))
}

/// Prefixes a sanitized key with the namespace of the owning watcher.
#[must_use]
pub fn namespaced(prefix: Option<&str>, key: &str) -> String {
    prefix.map_or_else(|| key.to_string(), |p| format!("{p}/{key}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_safe_characters_through() {
        assert_eq!(sanitize_key("Docs/Report (final).txt").unwrap(), "Docs/Report (final).txt");
        assert_eq!(sanitize_key("a-b_c.d/e").unwrap(), "a-b_c.d/e");
    }

    #[test]
    fn encodes_unsafe_characters_per_component() {
        assert_eq!(sanitize_key("a/b%c").unwrap(), "a/b%25c");
        assert_eq!(sanitize_key("naïve/q?.txt").unwrap(), "na%C3%AFve/q%3F.txt");
        assert_eq!(sanitize_key("dir/a+b").unwrap(), "dir/a%2Bb");
    }

    #[test]
    fn rejects_traversal_segments() {
        assert!(matches!(sanitize_key("a/../b"), Err(KeyError::Traversal(_))));
        assert!(matches!(sanitize_key("./a"), Err(KeyError::Traversal(_))));
        assert!(matches!(sanitize_key("a/.."), Err(KeyError::Traversal(_))));
    }

    #[test]
    fn collapses_empty_segments() {
        assert_eq!(sanitize_key("a//b///c").unwrap(), "a/b/c");
        assert!(matches!(sanitize_key("///"), Err(KeyError::Empty)));
    }

    #[test]
    fn applies_namespace_prefix() {
        assert_eq!(namespaced(Some("drive"), "a/b"), "drive/a/b");
        assert_eq!(namespaced(None, "a/b"), "a/b");
    }
}
