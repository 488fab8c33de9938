//! File-backed, human-readable document store with a MongoDB-style query
//! engine, optional equality indexes, and an optional sidecar attachment
//! layout.
//!
//! [`Store`] is the public entry point; open one with [`StoreOptions`].

pub mod atomic;
pub mod cache;
pub mod document;
pub mod error;
pub mod index;
pub mod query;
pub mod sandbox;
pub mod serializer;
pub mod store;

pub use document::Key;
pub use error::{Result, StoreError};
pub use query::{Projection, QuerySpec};
pub use store::{DetailedStats, FormatReport, FormatTarget, Store, StoreOptions, StoreStats, VerifyReport};
