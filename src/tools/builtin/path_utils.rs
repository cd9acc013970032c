//! Path resolution shared by the file tools and the execution sandbox.
//!
//! Resolution happens in two steps. [`absolutize`] turns a model-supplied
//! string into an absolute, lexically normalized path without touching the
//! filesystem; that is what the safety classifier sees. [`validate_path`]
//! then enforces that the path (after symlink resolution) stays inside the
//! workspace root before any I/O happens.

use std::path::{Component, Path, PathBuf};

use crate::tools::tool::ToolError;

/// Normalize a path by resolving `.` and `..` components lexically (no filesystem access).
///
/// `std::fs::canonicalize` only works on paths that exist, so for new files
/// we must normalize without touching the filesystem.
pub fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                // Only pop if there's a normal component to pop (don't escape root/prefix)
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Resolve `path_str` against `root` into an absolute, normalized path.
///
/// Does not check containment; absolute paths outside the root come back
/// unchanged so the classifier can judge them.
pub fn absolutize(path_str: &str, root: &Path) -> Result<PathBuf, ToolError> {
    if path_str.trim().is_empty() {
        return Err(ToolError::InvalidParameters("path must not be empty".into()));
    }
    if !is_path_safe_minimal(path_str) {
        return Err(ToolError::NotAuthorized(format!(
            "Path contains forbidden characters or sequences: {}",
            path_str
        )));
    }

    let path = PathBuf::from(path_str);
    let joined = if path.is_absolute() {
        path
    } else {
        root.join(path)
    };
    Ok(normalize_lexical(&joined))
}

/// Validate that a path stays inside `root` and return its resolved form.
///
/// The joined path is normalized lexically, then symlinks are resolved on the
/// nearest existing ancestor so a link pointing out of the workspace cannot be
/// used to escape it.
pub fn validate_path(path_str: &str, root: &Path) -> Result<PathBuf, ToolError> {
    let resolved = absolutize(path_str, root)?;
    ensure_within(&resolved, root)?;
    Ok(resolved)
}

/// Check an already absolute path against `root`.
pub fn ensure_within(resolved: &Path, root: &Path) -> Result<(), ToolError> {
    let root_canonical = root
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexical(root));

    let check_path = if resolved.exists() {
        resolved
            .canonicalize()
            .unwrap_or_else(|_| resolved.to_path_buf())
    } else {
        // Walk up to the nearest existing ancestor directory, canonicalize it,
        // then re-append the remaining tail.
        let mut ancestor = resolved;
        let mut tail_parts: Vec<&std::ffi::OsStr> = Vec::new();
        loop {
            if ancestor.exists() {
                let mut result = ancestor
                    .canonicalize()
                    .unwrap_or_else(|_| ancestor.to_path_buf());
                for part in tail_parts.into_iter().rev() {
                    result = result.join(part);
                }
                break result;
            }
            if let Some(name) = ancestor.file_name() {
                tail_parts.push(name);
            }
            match ancestor.parent() {
                Some(parent) if parent != ancestor => ancestor = parent,
                _ => break resolved.to_path_buf(),
            }
        }
    };

    if !check_path.starts_with(&root_canonical) {
        return Err(ToolError::NotAuthorized(format!(
            "Path {} is outside the workspace root {}",
            resolved.display(),
            root_canonical.display()
        )));
    }
    Ok(())
}

/// Null bytes and URL-encoded separators are never legitimate in a tool path.
fn is_path_safe_minimal(path: &str) -> bool {
    if path.contains('\0') {
        return false;
    }

    let lower = path.to_lowercase();
    !(lower.contains("%2e") || lower.contains("%2f") || lower.contains("%5c"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_lexical() {
        assert_eq!(
            normalize_lexical(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_lexical(Path::new("/../etc")), PathBuf::from("/etc"));
    }

    #[test]
    fn test_absolutize_keeps_outside_paths() {
        let root = Path::new("/work");
        assert_eq!(
            absolutize("/etc/passwd", root).unwrap(),
            PathBuf::from("/etc/passwd")
        );
        assert_eq!(
            absolutize("../etc/shadow", root).unwrap(),
            PathBuf::from("/etc/shadow")
        );
        assert_eq!(
            absolutize("notes/a.txt", root).unwrap(),
            PathBuf::from("/work/notes/a.txt")
        );
    }

    #[test]
    fn test_absolutize_rejects_encoded_and_empty() {
        let root = Path::new("/work");
        assert!(absolutize("%2e%2e%2fetc/passwd", root).is_err());
        assert!(absolutize("file\0.txt", root).is_err());
        assert!(matches!(
            absolutize("  ", root),
            Err(ToolError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_validate_path_allows_within_root() {
        let dir = tempdir().unwrap();
        assert!(validate_path("subdir/file.txt", dir.path()).is_ok());
        assert!(validate_path("a/b/../c.txt", dir.path()).is_ok());
    }

    #[test]
    fn test_validate_path_rejects_traversal() {
        let dir = tempdir().unwrap();
        let err = validate_path("../../etc/passwd", dir.path()).unwrap_err();
        assert!(matches!(err, ToolError::NotAuthorized(_)));
        assert!(validate_path("/etc/passwd", dir.path()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_path_rejects_symlink_escape() {
        let outside = tempdir().unwrap();
        let root = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        let err = validate_path("link/new.txt", root.path()).unwrap_err();
        assert!(matches!(err, ToolError::NotAuthorized(_)));
    }
}
