//! Equality index manager: per-`(type, field)` postings files, plus the
//! scoped slug/alias auxiliary indexes that share its mutex discipline.
//!
//! Each index is a canonicalized JSON mapping from a typed, unambiguous
//! value-key to a sorted, deduplicated list of document ids. Every
//! read-modify-write sequence on one `(type, field)` pair holds that pair's
//! mutex for the whole critical section: `std::sync::Mutex` gives the same
//! serialization an async mutex would, for a synchronous, thread-backed
//! store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::atomic;
use crate::document::{doc_id, get_path};
use crate::error::{Result, StoreError};
use crate::sandbox::PathSandbox;
use crate::serializer::{self, KeyOrder, SerializeOptions};

fn index_options() -> SerializeOptions {
    SerializeOptions {
        indent: 2,
        key_order: KeyOrder::Alpha,
        trailing_newline: true,
    }
}

/// Encode one scalar JSON value into its index key, per the type-discriminated
/// prefix scheme: `1` (a number) and `"1"` (a string) must never collide.
fn encode_scalar_key(value: &Value) -> String {
    match value {
        Value::Null => "__null__".to_string(),
        Value::Bool(b) => format!("__bool__{b}"),
        Value::Number(n) => format!("__num__{n}"),
        Value::String(s) => {
            if has_reserved_prefix(s) {
                format!("__str__:{s}")
            } else {
                s.clone()
            }
        }
        other => {
            let compact = SerializeOptions {
                indent: 0,
                key_order: KeyOrder::Alpha,
                trailing_newline: false,
            };
            let body = serializer::canonicalize(other, &compact).unwrap_or_default();
            format!("__obj__:{body}")
        }
    }
}

fn has_reserved_prefix(s: &str) -> bool {
    s.starts_with("__num__")
        || s.starts_with("__bool__")
        || s.starts_with("__null__")
        || s.starts_with("__obj__:")
        || s.starts_with("__str__:")
}

/// Expand a field value into the set of index keys it posts to: a scalar
/// posts to one key, an array posts to one key per element.
pub(crate) fn encode_value_keys(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(encode_scalar_key).collect(),
        other => vec![encode_scalar_key(other)],
    }
}

type Postings = BTreeMap<String, BTreeSet<String>>;

pub struct IndexManager {
    sandbox: Arc<PathSandbox>,
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl IndexManager {
    pub fn new(sandbox: Arc<PathSandbox>) -> Self {
        Self {
            sandbox,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, r#type: &str, field: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("index lock table poisoned");
        locks
            .entry((r#type.to_string(), field.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn index_path(&self, r#type: &str, field: &str) -> Result<PathBuf> {
        Ok(self.sandbox.resolve_index_dir(r#type)?.join(format!("{field}.json")))
    }

    /// Read an index file's postings. `Ok(None)` means the file does not
    /// exist; a malformed file is reported as `IndexCorrupt`.
    fn read_postings(&self, r#type: &str, field: &str, path: &PathBuf) -> Result<Option<Postings>> {
        let bytes = match std::fs::read_to_string(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.clone(),
                    source,
                })
            }
        };
        let parsed: Value = serde_json::from_str(&bytes).map_err(|e| StoreError::IndexCorrupt {
            r#type: r#type.to_string(),
            field: field.to_string(),
            reason: format!("invalid JSON: {e}"),
        })?;
        let obj = parsed.as_object().ok_or_else(|| StoreError::IndexCorrupt {
            r#type: r#type.to_string(),
            field: field.to_string(),
            reason: "index root is not an object".to_string(),
        })?;
        let mut postings = Postings::new();
        for (key, value) in obj {
            let ids = value.as_array().ok_or_else(|| StoreError::IndexCorrupt {
                r#type: r#type.to_string(),
                field: field.to_string(),
                reason: format!("posting for {key:?} is not an array"),
            })?;
            let mut set = BTreeSet::new();
            for id in ids {
                let id = id.as_str().ok_or_else(|| StoreError::IndexCorrupt {
                    r#type: r#type.to_string(),
                    field: field.to_string(),
                    reason: format!("posting id under {key:?} is not a string"),
                })?;
                set.insert(id.to_string());
            }
            postings.insert(key.clone(), set);
        }
        Ok(Some(postings))
    }

    fn write_postings(&self, path: &PathBuf, postings: &Postings) -> Result<()> {
        let mut map = Map::new();
        for (key, ids) in postings {
            if ids.is_empty() {
                continue;
            }
            map.insert(
                key.clone(),
                Value::Array(ids.iter().map(|id| Value::String(id.clone())).collect()),
            );
        }
        let text = serializer::canonicalize(&Value::Object(map), &index_options())?;
        atomic::write_atomic(path, text.as_bytes())
    }

    /// Rebuild the index for `(type, field)` from scratch over `docs`.
    pub fn ensure_index(&self, r#type: &str, field: &str, docs: &[Value]) -> Result<()> {
        let lock = self.lock_for(r#type, field);
        let _guard = lock.lock().expect("index mutex poisoned");
        let path = self.index_path(r#type, field)?;
        let mut postings = Postings::new();
        for doc in docs {
            let Some(id) = doc_id(doc) else { continue };
            if let Some(value) = get_path(doc, field) {
                for key in encode_value_keys(value) {
                    postings.entry(key).or_default().insert(id.to_string());
                }
            }
        }
        self.write_postings(&path, &postings)?;
        info!(r#type, field, documents = docs.len(), "index rebuilt");
        Ok(())
    }

    /// Apply the delta for one document's field value changing from
    /// `old_value` to `new_value` (either may be absent: insert/remove).
    pub fn update_index(
        &self,
        r#type: &str,
        field: &str,
        id: &str,
        old_value: Option<&Value>,
        new_value: Option<&Value>,
    ) -> Result<()> {
        let lock = self.lock_for(r#type, field);
        let _guard = lock.lock().expect("index mutex poisoned");
        let path = self.index_path(r#type, field)?;
        let mut postings = match self.read_postings(r#type, field, &path) {
            Ok(Some(p)) => p,
            Ok(None) => {
                warn!(r#type, field, "index missing, skipping update; run ensureIndex to rebuild");
                return Ok(());
            }
            Err(StoreError::IndexCorrupt { reason, .. }) => {
                warn!(r#type, field, reason, "index corrupt, skipping update; run ensureIndex to rebuild");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if let Some(old) = old_value {
            for key in encode_value_keys(old) {
                if let Some(set) = postings.get_mut(&key) {
                    set.remove(id);
                    if set.is_empty() {
                        postings.remove(&key);
                    }
                }
            }
        }
        if let Some(new) = new_value {
            for key in encode_value_keys(new) {
                postings.entry(key).or_default().insert(id.to_string());
            }
        }
        self.write_postings(&path, &postings)
    }

    /// Union the postings for every key `value` encodes to. Missing or
    /// corrupt indexes degrade to an empty result (callers fall back to a
    /// full scan).
    pub fn query_with_index(&self, r#type: &str, field: &str, value: &Value) -> Result<Vec<String>> {
        let lock = self.lock_for(r#type, field);
        let _guard = lock.lock().expect("index mutex poisoned");
        let path = self.index_path(r#type, field)?;
        let postings = match self.read_postings(r#type, field, &path) {
            Ok(Some(p)) => p,
            Ok(None) => return Ok(Vec::new()),
            Err(StoreError::IndexCorrupt { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut ids = BTreeSet::new();
        for key in encode_value_keys(value) {
            if let Some(set) = postings.get(&key) {
                ids.extend(set.iter().cloned());
            }
        }
        Ok(ids.into_iter().collect())
    }

    /// Read an index's current postings for diagnostic comparison against a
    /// full scan. Missing or corrupt indexes read as empty.
    pub fn debug_postings(&self, r#type: &str, field: &str) -> Result<BTreeMap<String, Vec<String>>> {
        let lock = self.lock_for(r#type, field);
        let _guard = lock.lock().expect("index mutex poisoned");
        let path = self.index_path(r#type, field)?;
        match self.read_postings(r#type, field, &path) {
            Ok(Some(postings)) => Ok(postings
                .into_iter()
                .map(|(k, ids)| (k, ids.into_iter().collect()))
                .collect()),
            Ok(None) => Ok(BTreeMap::new()),
            Err(StoreError::IndexCorrupt { .. }) => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }

    pub fn has_index(&self, r#type: &str, field: &str) -> Result<bool> {
        let lock = self.lock_for(r#type, field);
        let _guard = lock.lock().expect("index mutex poisoned");
        Ok(self.index_path(r#type, field)?.is_file())
    }

    pub fn list_indexes(&self, r#type: &str) -> Result<Vec<String>> {
        let dir = self.sandbox.resolve_index_dir(r#type)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut fields = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|source| StoreError::List {
            path: dir.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| StoreError::List {
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(field) = name.strip_suffix(".json") {
                if !field.starts_with('_') {
                    fields.push(field.to_string());
                }
            }
        }
        fields.sort();
        Ok(fields)
    }

    pub fn remove_index(&self, r#type: &str, field: &str) -> Result<()> {
        let lock = self.lock_for(r#type, field);
        let _guard = lock.lock().expect("index mutex poisoned");
        atomic::remove_atomic(&self.index_path(r#type, field)?)
    }

    pub fn rebuild_indexes(&self, r#type: &str, fields: Option<&[String]>, docs: &[Value]) -> Result<()> {
        let targets: Vec<String> = match fields {
            Some(f) => f.to_vec(),
            None => self.list_indexes(r#type)?,
        };
        for field in targets {
            self.ensure_index(r#type, &field, docs)?;
        }
        Ok(())
    }

    fn slug_path(&self, r#type: &str) -> Result<PathBuf> {
        Ok(self.sandbox.resolve_index_dir(r#type)?.join("_slug.json"))
    }

    fn alias_path(&self, r#type: &str) -> Result<PathBuf> {
        Ok(self.sandbox.resolve_index_dir(r#type)?.join("_alias.json"))
    }

    /// Claim `slug` within `scope` for `id`. Re-claiming by the current
    /// holder is a no-op; claiming a slug held by a different id fails,
    /// returning the current holder.
    pub fn claim_slug(&self, r#type: &str, scope: &str, slug: &str, id: &str) -> Result<SlugClaim> {
        let lock = self.lock_for(r#type, "_slug");
        let _guard = lock.lock().expect("index mutex poisoned");
        let path = self.slug_path(r#type)?;
        let mut scopes = self.read_nested_map(r#type, "_slug", &path)?;
        let entry = scopes.entry(scope.to_string()).or_default();
        if let Some(holder) = entry.get(slug) {
            if holder != id {
                return Ok(SlugClaim::AlreadyClaimed {
                    holder: holder.clone(),
                });
            }
            return Ok(SlugClaim::Claimed);
        }
        entry.insert(slug.to_string(), id.to_string());
        self.write_nested_map(&path, &scopes)?;
        Ok(SlugClaim::Claimed)
    }

    pub fn lookup_slug(&self, r#type: &str, scope: &str, slug: &str) -> Result<Option<String>> {
        let lock = self.lock_for(r#type, "_slug");
        let _guard = lock.lock().expect("index mutex poisoned");
        let path = self.slug_path(r#type)?;
        let scopes = self.read_nested_map(r#type, "_slug", &path)?;
        Ok(scopes.get(scope).and_then(|m| m.get(slug)).cloned())
    }

    pub fn release_slug(&self, r#type: &str, scope: &str, slug: &str) -> Result<()> {
        let lock = self.lock_for(r#type, "_slug");
        let _guard = lock.lock().expect("index mutex poisoned");
        let path = self.slug_path(r#type)?;
        let mut scopes = self.read_nested_map(r#type, "_slug", &path)?;
        if let Some(m) = scopes.get_mut(scope) {
            m.remove(slug);
        }
        self.write_nested_map(&path, &scopes)
    }

    pub fn claim_alias(&self, r#type: &str, alias: &str, id: &str) -> Result<SlugClaim> {
        let lock = self.lock_for(r#type, "_alias");
        let _guard = lock.lock().expect("index mutex poisoned");
        let path = self.alias_path(r#type)?;
        let mut aliases = self.read_flat_map(r#type, "_alias", &path)?;
        if let Some(holder) = aliases.get(alias) {
            if holder != id {
                return Ok(SlugClaim::AlreadyClaimed {
                    holder: holder.clone(),
                });
            }
            return Ok(SlugClaim::Claimed);
        }
        aliases.insert(alias.to_string(), id.to_string());
        self.write_flat_map(&path, &aliases)?;
        Ok(SlugClaim::Claimed)
    }

    pub fn lookup_alias(&self, r#type: &str, alias: &str) -> Result<Option<String>> {
        let lock = self.lock_for(r#type, "_alias");
        let _guard = lock.lock().expect("index mutex poisoned");
        let path = self.alias_path(r#type)?;
        Ok(self.read_flat_map(r#type, "_alias", &path)?.get(alias).cloned())
    }

    fn read_nested_map(
        &self,
        r#type: &str,
        field: &str,
        path: &PathBuf,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|e| StoreError::IndexCorrupt {
            r#type: r#type.to_string(),
            field: field.to_string(),
            reason: format!("invalid JSON: {e}"),
        })
    }

    fn write_nested_map(&self, path: &PathBuf, map: &BTreeMap<String, BTreeMap<String, String>>) -> Result<()> {
        let value = serde_json::to_value(map).expect("map of strings always serializes");
        let text = serializer::canonicalize(&value, &index_options())?;
        atomic::write_atomic(path, text.as_bytes())
    }

    fn read_flat_map(&self, r#type: &str, field: &str, path: &PathBuf) -> Result<BTreeMap<String, String>> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|e| StoreError::IndexCorrupt {
            r#type: r#type.to_string(),
            field: field.to_string(),
            reason: format!("invalid JSON: {e}"),
        })
    }

    fn write_flat_map(&self, path: &PathBuf, map: &BTreeMap<String, String>) -> Result<()> {
        let value = serde_json::to_value(map).expect("map of strings always serializes");
        let text = serializer::canonicalize(&value, &index_options())?;
        atomic::write_atomic(path, text.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlugClaim {
    Claimed,
    AlreadyClaimed { holder: String },
}
