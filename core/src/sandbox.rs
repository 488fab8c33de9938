//! Path sandbox: the single gate through which every `(type, id)` pair is
//! turned into a filesystem path. Rejects names that fail the grammar,
//! paths that would land outside the configured root, and any path that
//! walks through a symbolic link component.

use std::fs;
use std::path::{Path, PathBuf};

use crate::document::{validate_name, Key};
use crate::error::{Result, StoreError};

#[derive(Debug, Clone)]
pub struct PathSandbox {
    /// Canonicalized once at store open; every resolved path is checked
    /// against this.
    root: PathBuf,
}

impl PathSandbox {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|source| StoreError::Write {
            path: root.to_path_buf(),
            source,
        })?;
        let root = root.canonicalize().map_err(|source| StoreError::Write {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `key` to `root/type/id.<ext>`, validating the name grammar
    /// and rejecting any symlink component. The tail component (the file
    /// itself) is permitted to not exist yet.
    pub fn resolve(&self, key: &Key, ext: &str) -> Result<PathBuf> {
        key.validate()?;
        let rel = Path::new(&key.r#type).join(format!("{}.{}", key.id, ext));
        self.resolve_relative(&rel)
    }

    /// Resolve the sidecar directory for a key: `root/type/id/`.
    pub fn resolve_sidecar_dir(&self, key: &Key) -> Result<PathBuf> {
        key.validate()?;
        let rel = Path::new(&key.r#type).join(&key.id);
        self.resolve_relative(&rel)
    }

    /// Resolve a sidecar attachment path relative to its document directory,
    /// rejecting `..`, absolute paths, and anything not ending in `.md`.
    pub fn resolve_attachment(&self, key: &Key, rel_name: &str) -> Result<PathBuf> {
        if rel_name.is_empty()
            || rel_name.starts_with('/')
            || rel_name.contains("..")
            || rel_name.contains('\\')
            || !rel_name.ends_with(".md")
        {
            return Err(StoreError::Validation(format!(
                "invalid sidecar attachment path: {rel_name:?}"
            )));
        }
        let dir = self.resolve_sidecar_dir(key)?;
        let path = dir.join(rel_name);
        self.assert_no_symlink(&path)?;
        Ok(path)
    }

    /// Resolve the type directory (`root/type/`), checking for symlink
    /// escape, for `list(type)`.
    pub fn resolve_type_dir(&self, r#type: &str) -> Result<PathBuf> {
        validate_name(r#type)?;
        let rel = Path::new(r#type);
        self.resolve_relative(rel)
    }

    /// Resolve the index directory for a type (`root/type/_indexes/`).
    pub fn resolve_index_dir(&self, r#type: &str) -> Result<PathBuf> {
        validate_name(r#type)?;
        let rel = Path::new(r#type).join("_indexes");
        self.resolve_relative(&rel)
    }

    fn resolve_relative(&self, rel: &Path) -> Result<PathBuf> {
        if rel.is_absolute() {
            return Err(StoreError::PathEscape(format!(
                "absolute paths are not allowed: {rel:?}"
            )));
        }
        let candidate = self.root.join(rel);
        if !candidate.starts_with(&self.root) {
            return Err(StoreError::PathEscape(format!(
                "path escapes root: {candidate:?}"
            )));
        }
        self.assert_no_symlink(&candidate)?;
        Ok(candidate)
    }

    /// Walk every component from the root to `path`, failing if any
    /// existing component is a symbolic link. Must be re-run immediately
    /// before each I/O call to close the window between check and use.
    pub fn assert_no_symlink(&self, path: &Path) -> Result<()> {
        let rel = path.strip_prefix(&self.root).map_err(|_| {
            StoreError::PathEscape(format!("path escapes root: {path:?}"))
        })?;
        let mut cur = self.root.clone();
        for component in rel.components() {
            cur.push(component);
            match fs::symlink_metadata(&cur) {
                Ok(meta) => {
                    if meta.file_type().is_symlink() {
                        return Err(StoreError::Symlink(cur));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Tail components are permitted to not exist yet.
                    break;
                }
                Err(source) => {
                    return Err(StoreError::Read {
                        path: cur,
                        source,
                    })
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_simple_key_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = PathSandbox::new(dir.path()).unwrap();
        let key = Key::new("task", "1");
        let path = sandbox.resolve(&key, "json").unwrap();
        assert!(path.starts_with(sandbox.root()));
        assert_eq!(path.file_name().unwrap(), "1.json");
    }

    #[test]
    fn rejects_path_traversal_in_key() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = PathSandbox::new(dir.path()).unwrap();
        let key = Key::new("task", "../../etc/passwd");
        assert!(sandbox.resolve(&key, "json").is_err());

        let key2 = Key::new("..", "x");
        assert!(sandbox.resolve(&key2, "json").is_err());
    }

    #[test]
    fn rejects_symlinked_type_directory() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::symlink;
            let dir = tempfile::tempdir().unwrap();
            let outside = tempfile::tempdir().unwrap();
            symlink(outside.path(), dir.path().join("task")).unwrap();
            let sandbox = PathSandbox::new(dir.path()).unwrap();
            let key = Key::new("task", "1");
            assert!(matches!(
                sandbox.resolve(&key, "json"),
                Err(StoreError::Symlink(_))
            ));
        }
    }
}
