//! Error taxonomy for the store.
//!
//! Variants correspond one-to-one with the error kinds a caller needs to
//! distinguish: validation failures are not retried, `not-found` is
//! swallowed by some entry points and surfaced by others, and so on. See
//! each operation's doc comment for its exact propagation behavior.

use std::path::PathBuf;

use thiserror::Error;

/// The error type returned by every fallible `Store` operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("read error at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("write error at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("remove error at {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("directory transaction failed for {target}: {reason}")]
    Directory { target: PathBuf, reason: String },

    #[error("list error at {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("format error at {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("parse error at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("canonicalization error: {0}")]
    Canonicalization(String),

    #[error("path escape: {0}")]
    PathEscape(String),

    #[error("symlink encountered at {0}")]
    Symlink(PathBuf),

    #[error("integrity check failed for {path}: {reason}")]
    Integrity { path: PathBuf, reason: String },

    #[error("index corrupt for ({r#type}, {field}): {reason}")]
    IndexCorrupt {
        r#type: String,
        field: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// True for errors that must not be retried without changing inputs, per
    /// the propagation policy: validation, path-escape, symlink, integrity,
    /// and canonicalization errors are all caller mistakes or tamper
    /// evidence, not transient conditions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StoreError::Validation(_)
                | StoreError::PathEscape(_)
                | StoreError::Symlink(_)
                | StoreError::Integrity { .. }
                | StoreError::Canonicalization(_)
        )
    }
}
