//! Path normalization for index keys
//!
//! Index keys are relative paths with `/` separators regardless of
//! platform. Keys received from peers are untrusted and must be
//! re-normalized before touching the filesystem.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Normalize a relative path into an index key.
///
/// Rejects:
/// 1. empty paths and paths containing NUL
/// 2. absolute paths, parent directory components, and root/prefix components
/// 3. on Windows, components containing ':' (ADS defense)
pub fn normalize_key(p: &str) -> Result<String> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.contains('\0') {
        bail!("path contains NUL byte");
    }

    let mut parts = Vec::new();
    for component in Path::new(p).components() {
        match component {
            CurDir => {}
            Normal(s) => {
                let Some(s) = s.to_str() else {
                    bail!("path component is not valid UTF-8");
                };
                #[cfg(windows)]
                if s.contains(':') {
                    bail!("path component contains colon (potential ADS attack)");
                }
                parts.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }

    if parts.is_empty() {
        bail!("empty path");
    }
    Ok(parts.join("/"))
}

/// Index key of `path` relative to `root`, or `None` if it is outside the
/// root or not representable as UTF-8
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(s) => parts.push(s.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Filesystem location of an index key under `root`.
///
/// `root` must be canonical. Directories along the way are resolved
/// through symlinks and must stay under `root`; the final component is
/// left as is, so replacing it never writes through a link.
pub fn resolve_under_root(root: &Path, key: &str) -> Result<PathBuf> {
    let key = normalize_key(key)?;
    let mut path = root.to_path_buf();
    path.extend(key.split('/'));
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        bail!("empty path");
    };

    // Canonicalize the nearest ancestor that exists, then re-append the rest
    let mut existing = parent.to_path_buf();
    let mut missing = Vec::new();
    while fs::symlink_metadata(&existing).is_err() {
        let (Some(component), Some(up)) = (existing.file_name(), existing.parent()) else {
            break;
        };
        missing.push(component.to_os_string());
        existing = up.to_path_buf();
    }
    let mut resolved = existing
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {}", existing.display()))?;
    resolved.extend(missing.iter().rev());

    if !resolved.starts_with(root) {
        bail!("path {key:?} escapes root {}", root.display());
    }
    resolved.push(name);
    Ok(resolved)
}

/// Flat file name derived from a key, for use inside the temp directory
pub fn temp_file_name(key: &str) -> String {
    key.replace('/', "__")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key_safe_paths() {
        assert_eq!(normalize_key("subdir/file.txt").unwrap(), "subdir/file.txt");
        assert_eq!(
            normalize_key("./subdir/./file.txt").unwrap(),
            "subdir/file.txt"
        );
    }

    #[test]
    fn test_normalize_key_unsafe_paths() {
        assert!(normalize_key("../etc/passwd").is_err());
        assert!(normalize_key("subdir/../../etc/passwd").is_err());
        assert!(normalize_key("/etc/passwd").is_err());
        assert!(normalize_key("file\0.txt").is_err());
        assert!(normalize_key("").is_err());
        assert!(normalize_key(".").is_err());
    }

    #[test]
    fn test_relative_key_and_resolve() {
        let root = Path::new("/data/share");
        let file = root.join("a").join("b.txt");

        let key = relative_key(root, &file).unwrap();
        assert_eq!(key, "a/b.txt");
        assert_eq!(resolve_under_root(root, &key).unwrap(), file);
        assert!(relative_key(root, Path::new("/elsewhere/x")).is_none());
        assert!(relative_key(root, root).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlinked_escape() {
        let root_tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let root = root_tmp.path().canonicalize().unwrap();
        fs::create_dir(root.join("inner")).unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();
        std::os::unix::fs::symlink(root.join("inner"), root.join("alias")).unwrap();

        assert!(resolve_under_root(&root, "link/x.txt").is_err());
        assert!(resolve_under_root(&root, "link/new/deep/x.txt").is_err());

        assert_eq!(
            resolve_under_root(&root, "inner/x.txt").unwrap(),
            root.join("inner/x.txt")
        );
        assert_eq!(
            resolve_under_root(&root, "alias/x.txt").unwrap(),
            root.join("inner/x.txt")
        );
        assert_eq!(
            resolve_under_root(&root, "new/deep/x.txt").unwrap(),
            root.join("new/deep/x.txt")
        );
        // The link itself is a valid target, it is replaced rather than followed
        assert_eq!(resolve_under_root(&root, "link").unwrap(), root.join("link"));
    }

    #[test]
    fn test_temp_file_name_is_flat() {
        assert_eq!(temp_file_name("a/b/c.txt"), "a__b__c.txt");
    }
}
