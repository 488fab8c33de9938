//! Atomic single-file writes and the directory-transaction protocol used
//! when a logical update spans several files in one document directory
//! (a primary record plus sidecar attachments).

use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::sandbox::PathSandbox;

/// Write `bytes` to `path` by staging in a sibling file then renaming over
/// the target. Readers never observe partial content: the rename is the
/// only operation that makes the new bytes visible.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        StoreError::Write {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent"),
        }
    })?;
    fs::create_dir_all(parent).map_err(|source| StoreError::Write {
        path: parent.to_path_buf(),
        source,
    })?;
    let staging = sibling_staging_path(path);
    let write_result = fs::write(&staging, bytes);
    if let Err(source) = write_result {
        let _ = fs::remove_file(&staging);
        return Err(StoreError::Write {
            path: path.to_path_buf(),
            source,
        });
    }
    if let Err(source) = fs::rename(&staging, path) {
        let _ = fs::remove_file(&staging);
        return Err(StoreError::Write {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

fn sibling_staging_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging_name = format!(".{file_name}.staging.{}", Uuid::new_v4());
    path.with_file_name(staging_name)
}

/// Remove `path`. Idempotent: a missing file is not an error.
pub fn remove_atomic(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// A staged update to a document directory. Files are written into a
/// staging directory; `commit` swaps it in for the target directory with a
/// backup-then-two-renames sequence so a concurrent reader always sees
/// either the whole pre-transaction directory or the whole post-transaction
/// one.
pub struct DirTransaction {
    target: PathBuf,
    staging: PathBuf,
    committed_or_aborted: bool,
}

impl DirTransaction {
    /// Open a staging directory as a sibling of `target`, seeded with a
    /// copy of `target`'s existing contents (if any) so files the caller
    /// does not rewrite are preserved.
    pub fn begin(target: &Path) -> Result<Self> {
        let staging = sibling_staging_dir(target);
        fs::create_dir_all(&staging).map_err(|source| StoreError::Directory {
            target: target.to_path_buf(),
            reason: format!("could not create staging directory: {source}"),
        })?;
        if target.exists() {
            copy_dir_contents(target, &staging).map_err(|source| StoreError::Directory {
                target: target.to_path_buf(),
                reason: format!("could not seed staging directory: {source}"),
            })?;
        }
        Ok(Self {
            target: target.to_path_buf(),
            staging,
            committed_or_aborted: false,
        })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// Write one file into the staging directory, overwriting any seeded
    /// copy.
    pub fn write_file(&self, file_name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.staging.join(file_name);
        fs::write(&path, bytes).map_err(|source| StoreError::Write { path, source })
    }

    /// Commit the transaction: re-validate every destination path (closing
    /// the TOCTOU window between initial validation and commit), then swap
    /// the staging directory in for the target.
    pub fn commit(mut self, sandbox: &PathSandbox) -> Result<()> {
        for entry in fs::read_dir(&self.staging).map_err(|source| StoreError::Directory {
            target: self.target.clone(),
            reason: format!("could not enumerate staging directory: {source}"),
        })? {
            let entry = entry.map_err(|source| StoreError::Directory {
                target: self.target.clone(),
                reason: format!("could not read staging entry: {source}"),
            })?;
            let dest = self.target.join(entry.file_name());
            sandbox.assert_no_symlink(&dest)?;
        }

        let backup = sibling_backup_dir(&self.target);
        let target_existed = self.target.exists();
        if target_existed {
            fs::rename(&self.target, &backup).map_err(|source| StoreError::Directory {
                target: self.target.clone(),
                reason: format!("could not move target aside for commit: {source}"),
            })?;
        }

        match fs::rename(&self.staging, &self.target) {
            Ok(()) => {
                if target_existed {
                    let _ = fs::remove_dir_all(&backup);
                }
                self.committed_or_aborted = true;
                Ok(())
            }
            Err(source) => {
                // Roll back: restore the backup, remove any partial rename.
                if target_existed {
                    let _ = fs::rename(&backup, &self.target);
                }
                let _ = fs::remove_dir_all(&self.staging);
                self.committed_or_aborted = true;
                Err(StoreError::Directory {
                    target: self.target.clone(),
                    reason: format!("commit rename failed, rolled back: {source}"),
                })
            }
        }
    }

    /// Abandon the transaction, removing the staging directory.
    pub fn abort(mut self) -> Result<()> {
        self.committed_or_aborted = true;
        fs::remove_dir_all(&self.staging).or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Ok(())
            } else {
                Err(StoreError::Directory {
                    target: self.target.clone(),
                    reason: format!("could not remove staging directory: {e}"),
                })
            }
        })
    }
}

impl Drop for DirTransaction {
    fn drop(&mut self) {
        // Best-effort cleanup if the caller dropped the transaction without
        // calling commit/abort (e.g. due to an early `?` return upstream).
        if !self.committed_or_aborted {
            let _ = fs::remove_dir_all(&self.staging);
        }
    }
}

fn sibling_staging_dir(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.staging.{}", Uuid::new_v4()))
}

fn sibling_backup_dir(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.bak.{}", Uuid::new_v4()))
}

fn copy_dir_contents(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            fs::create_dir_all(&dest_path)?;
            copy_dir_contents(&entry.path(), &dest_path)?;
        } else {
            fs::copy(entry.path(), &dest_path)?;
        }
    }
    Ok(())
}
