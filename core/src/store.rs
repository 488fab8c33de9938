//! The store facade: composes the path sandbox, canonical serializer,
//! atomic writer, document cache, index manager, and query evaluator into
//! the public `put`/`get`/`remove`/`list`/`query`/`format`/`stats` surface.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::atomic::{self, DirTransaction};
use crate::cache::{DocumentCache, FileStat};
use crate::document::{get_path, validate_doc_matches_key, Key};
use crate::error::{Result, StoreError};
use crate::index::IndexManager;
use crate::query::{self, Projection, QuerySpec};
use crate::sandbox::PathSandbox;
use crate::serializer::{self, KeyOrder, ParseOutcome, SerializeOptions};

/// Environment switch that forces the document cache off regardless of the
/// configured entry count, for debugging and for test isolation.
pub const CACHE_DISABLE_ENV: &str = "SCRIBE_DISABLE_CACHE";

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub root: PathBuf,
    pub indent: usize,
    pub key_order: KeyOrder,
    pub enable_indexes: bool,
    pub indexes: HashMap<String, Vec<String>>,
    pub format_concurrency: usize,
    pub sidecar_types: HashSet<String>,
    pub cache_max_entries: usize,
    pub cache_max_memory_bytes: Option<usize>,
    pub ext: String,
}

impl StoreOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            indent: 2,
            key_order: KeyOrder::Alpha,
            enable_indexes: false,
            indexes: HashMap::new(),
            format_concurrency: 16,
            sidecar_types: HashSet::new(),
            cache_max_entries: 1000,
            cache_max_memory_bytes: None,
            ext: "json".to_string(),
        }
    }

    pub fn indent(mut self, indent: usize) -> Self {
        self.indent = indent;
        self
    }

    pub fn key_order(mut self, key_order: KeyOrder) -> Self {
        self.key_order = key_order;
        self
    }

    pub fn enable_indexes(mut self, enable: bool) -> Self {
        self.enable_indexes = enable;
        self
    }

    pub fn with_index(mut self, r#type: impl Into<String>, field: impl Into<String>) -> Self {
        self.indexes.entry(r#type.into()).or_default().push(field.into());
        self
    }

    pub fn format_concurrency(mut self, n: usize) -> Self {
        self.format_concurrency = n.clamp(1, 64);
        self
    }

    pub fn sidecar_type(mut self, r#type: impl Into<String>) -> Self {
        self.sidecar_types.insert(r#type.into());
        self
    }

    pub fn cache_max_entries(mut self, n: usize) -> Self {
        self.cache_max_entries = n;
        self
    }

    pub fn cache_max_memory_bytes(mut self, bytes: Option<usize>) -> Self {
        self.cache_max_memory_bytes = bytes;
        self
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct StoreStats {
    pub count: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DetailedStats {
    pub count: u64,
    pub total_bytes: u64,
    pub min_bytes: Option<u64>,
    pub max_bytes: Option<u64>,
    pub avg_bytes: f64,
    pub per_type: HashMap<String, u64>,
}

#[derive(Debug, Clone)]
pub enum FormatTarget {
    All,
    Type(String),
    Document(Key),
}

#[derive(Debug, Clone, Default)]
pub struct FormatReport {
    pub changed: usize,
    pub failures: Vec<(PathBuf, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub parse_failures: Vec<(PathBuf, String)>,
    pub format_drift: usize,
    pub index_mismatches: Vec<(String, String)>,
}

pub struct Store {
    sandbox: Arc<PathSandbox>,
    options: StoreOptions,
    cache: Mutex<DocumentCache>,
    index_manager: IndexManager,
    configured_indexes: Mutex<HashMap<String, Vec<String>>>,
}

impl Store {
    pub fn open(options: StoreOptions) -> Result<Self> {
        let sandbox = Arc::new(PathSandbox::new(&options.root)?);
        let cache_entries = if std::env::var_os(CACHE_DISABLE_ENV).is_some() {
            0
        } else {
            options.cache_max_entries
        };
        let cache = Mutex::new(DocumentCache::new(cache_entries, options.cache_max_memory_bytes));
        let index_manager = IndexManager::new(sandbox.clone());
        let configured_indexes = Mutex::new(options.indexes.clone());
        Ok(Self {
            sandbox,
            options,
            cache,
            index_manager,
            configured_indexes,
        })
    }

    fn serialize_options(&self) -> SerializeOptions {
        SerializeOptions {
            indent: self.options.indent,
            key_order: self.options.key_order.clone(),
            trailing_newline: true,
        }
    }

    fn primary_path(&self, key: &Key) -> Result<PathBuf> {
        if self.options.sidecar_types.contains(&key.r#type) {
            Ok(self
                .sandbox
                .resolve_sidecar_dir(key)?
                .join(format!("{}.{}", key.id, self.options.ext)))
        } else {
            self.sandbox.resolve(key, &self.options.ext)
        }
    }

    fn configured_fields_for(&self, r#type: &str) -> Vec<String> {
        self.configured_indexes
            .lock()
            .expect("configured index table poisoned")
            .get(r#type)
            .cloned()
            .unwrap_or_default()
    }

    /// Validate key/doc, canonicalize, skip an identical rewrite, atomically
    /// write otherwise, invalidate the cache, and apply index deltas.
    pub fn put(&self, key: &Key, doc: &Value) -> Result<()> {
        key.validate()?;
        validate_doc_matches_key(doc, key)?;
        let path = self.primary_path(key)?;
        let canonical = serializer::canonicalize(doc, &self.serialize_options())?;
        let existing = fs::read_to_string(&path).ok();
        self.cache.lock().expect("cache poisoned").delete(&path);
        if existing.as_deref() == Some(canonical.as_str()) {
            debug!(r#type = %key.r#type, id = %key.id, "put suppressed: identical content");
            return Ok(());
        }
        let prior_doc: Option<Value> = existing.as_deref().and_then(|s| serde_json::from_str(s).ok());

        self.sandbox.assert_no_symlink(&path)?;
        atomic::write_atomic(&path, canonical.as_bytes())?;

        if self.options.enable_indexes {
            for field in self.configured_fields_for(&key.r#type) {
                let old_value = prior_doc.as_ref().and_then(|d| get_path(d, &field).cloned());
                let new_value = get_path(doc, &field).cloned();
                self.index_manager
                    .update_index(&key.r#type, &field, &key.id, old_value.as_ref(), new_value.as_ref())?;
            }
        }
        Ok(())
    }

    /// TOCTOU-safe read: stat, cache probe, and on miss a read-parse-restat
    /// cycle retried up to three times before falling back to an uncached
    /// final read.
    pub fn get(&self, key: &Key) -> Result<Option<Value>> {
        key.validate()?;
        let path = self.primary_path(key)?;

        for _ in 0..3 {
            self.sandbox.assert_no_symlink(&path)?;
            let stat1 = match fs::metadata(&path) {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(source) => return Err(StoreError::Read { path, source }),
            };
            let filestat1 = FileStat::from_metadata(&stat1).map_err(|source| StoreError::Read {
                path: path.clone(),
                source,
            })?;

            if let Some(doc) = self.cache.lock().expect("cache poisoned").get(&path, filestat1) {
                return Ok(Some((*doc).clone()));
            }

            let bytes = match fs::read_to_string(&path) {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(source) => return Err(StoreError::Read { path, source }),
            };
            let parsed: Value = serde_json::from_str(&bytes).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?;
            validate_doc_matches_key(&parsed, key)?;

            let stat2 = match fs::metadata(&path) {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(source) => return Err(StoreError::Read { path, source }),
            };
            let filestat2 = FileStat::from_metadata(&stat2).map_err(|source| StoreError::Read {
                path: path.clone(),
                source,
            })?;

            if filestat1 == filestat2 {
                self.cache
                    .lock()
                    .expect("cache poisoned")
                    .set(path.clone(), Arc::new(parsed.clone()), filestat2);
                return Ok(Some(parsed));
            }
            debug!(?path, "stat changed mid-read, retrying");
        }

        match fs::read_to_string(&path) {
            Ok(bytes) => {
                let parsed: Value = serde_json::from_str(&bytes).map_err(|source| StoreError::Parse {
                    path: path.clone(),
                    source,
                })?;
                validate_doc_matches_key(&parsed, key)?;
                Ok(Some(parsed))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read { path, source }),
        }
    }

    /// Idempotent delete: a missing document is not an error.
    pub fn remove(&self, key: &Key) -> Result<()> {
        key.validate()?;
        let path = self.primary_path(key)?;
        let prior_doc: Option<Value> = fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok());

        self.sandbox.assert_no_symlink(&path)?;
        atomic::remove_atomic(&path)?;
        self.cache.lock().expect("cache poisoned").delete(&path);

        if self.options.enable_indexes {
            if let Some(doc) = &prior_doc {
                for field in self.configured_fields_for(&key.r#type) {
                    if let Some(old_value) = get_path(doc, &field).cloned() {
                        self.index_manager
                            .update_index(&key.r#type, &field, &key.id, Some(&old_value), None)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Sorted list of ids under `type`, covering both flat and sidecar
    /// layouts.
    pub fn list(&self, r#type: &str) -> Result<Vec<String>> {
        let dir = self.sandbox.resolve_type_dir(r#type)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|source| StoreError::List {
            path: dir.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| StoreError::List {
                path: dir.clone(),
                source,
            })?;
            let file_type = entry.file_type().map_err(|source| StoreError::List {
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('_') {
                continue;
            }
            if file_type.is_file() {
                if let Some(id) = name.strip_suffix(&format!(".{}", self.options.ext)) {
                    ids.push(id.to_string());
                }
            } else if file_type.is_dir() {
                let inner = dir.join(&name).join(format!("{name}.{}", self.options.ext));
                if inner.is_file() {
                    ids.push(name);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn discover_types(&self) -> Result<Vec<String>> {
        let root = self.sandbox.root();
        let mut types = Vec::new();
        for entry in fs::read_dir(root).map_err(|source| StoreError::List {
            path: root.to_path_buf(),
            source,
        })? {
            let entry = entry.map_err(|source| StoreError::List {
                path: root.to_path_buf(),
                source,
            })?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.starts_with('_') {
                    types.push(name);
                }
            }
        }
        types.sort();
        Ok(types)
    }

    fn load_scope_docs(&self, type_filter: &Option<String>) -> Result<Vec<Value>> {
        let types = match type_filter {
            Some(t) => vec![t.clone()],
            None => self.discover_types()?,
        };
        let mut docs = Vec::new();
        for t in types {
            for id in self.list(&t)? {
                if let Some(doc) = self.get(&Key::new(t.clone(), id))? {
                    docs.push(doc);
                }
            }
        }
        Ok(docs)
    }

    fn load_ids(&self, r#type: &str, ids: &[String]) -> Result<Vec<Value>> {
        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.get(&Key::new(r#type, id.clone()))? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// Validate, select a fast path when the query shape allows, and
    /// otherwise fall back to a full scan of the scope.
    pub fn query(&self, spec: QuerySpec) -> Result<Vec<Value>> {
        spec.validate()?;

        if spec.sort.is_empty() && matches!(spec.projection, Projection::None) {
            if let Some(r#type) = &spec.r#type {
                if let Some(fast) = query::id_fast_path(&spec.filter) {
                    let ids = match fast {
                        query::IdFastPath::Eq(id) => vec![id],
                        query::IdFastPath::In(ids) => ids,
                    };
                    let docs = self.load_ids(r#type, &ids)?;
                    return Ok(slice(docs, spec.skip, spec.limit));
                }
                if let Some((field, value)) = query::index_fast_path(&spec.filter) {
                    if self.index_manager.has_index(r#type, &field)? {
                        let ids = self.index_manager.query_with_index(r#type, &field, &value)?;
                        let ids = slice(ids, spec.skip, spec.limit);
                        return self.load_ids(r#type, &ids);
                    }
                }
            }
        }

        let docs = self.load_scope_docs(&spec.r#type)?;
        query::evaluate(docs, &spec)
    }

    pub fn ensure_index(&self, r#type: &str, field: &str) -> Result<()> {
        let docs = self.load_scope_docs(&Some(r#type.to_string()))?;
        self.index_manager.ensure_index(r#type, field, &docs)?;
        self.configured_indexes
            .lock()
            .expect("configured index table poisoned")
            .entry(r#type.to_string())
            .or_default()
            .push(field.to_string());
        Ok(())
    }

    pub fn rebuild_indexes(&self, r#type: &str, fields: Option<&[String]>) -> Result<()> {
        let docs = self.load_scope_docs(&Some(r#type.to_string()))?;
        self.index_manager.rebuild_indexes(r#type, fields, &docs)
    }

    fn format_paths(&self, target: &FormatTarget) -> Result<Vec<PathBuf>> {
        match target {
            FormatTarget::Document(key) => {
                let path = self.primary_path(key)?;
                Ok(if path.is_file() { vec![path] } else { Vec::new() })
            }
            FormatTarget::Type(r#type) => {
                let mut paths = Vec::new();
                for id in self.list(r#type)? {
                    let path = self.primary_path(&Key::new(r#type.clone(), id))?;
                    if path.is_file() {
                        paths.push(path);
                    }
                }
                Ok(paths)
            }
            FormatTarget::All => {
                let mut paths = Vec::new();
                for r#type in self.discover_types()? {
                    paths.extend(self.format_paths(&FormatTarget::Type(r#type))?);
                }
                Ok(paths)
            }
        }
    }

    /// Reformat files to the canonical form. Each file is re-checked for
    /// concurrent modification (by stat) between the initial snapshot and
    /// the rewrite; a file that changed in between is skipped rather than
    /// clobbered.
    pub fn format(&self, target: FormatTarget, dry_run: bool, fail_fast: bool) -> Result<FormatReport> {
        let mut report = FormatReport::default();
        for path in self.format_paths(&target)? {
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    if fail_fast {
                        return Err(StoreError::Read { path, source });
                    }
                    report.failures.push((path, source.to_string()));
                    continue;
                }
            };
            let stat1 = fs::metadata(&path).ok().and_then(|m| FileStat::from_metadata(&m).ok());

            match serializer::safe_parse(&content) {
                ParseOutcome::Err(reason) => {
                    if fail_fast {
                        return Err(StoreError::Format { path, reason });
                    }
                    report.failures.push((path, reason));
                }
                ParseOutcome::Ok(value) => {
                    let canonical = serializer::canonicalize(&value, &self.serialize_options())?;
                    if canonical != content {
                        report.changed += 1;
                        if !dry_run {
                            let stat2 = fs::metadata(&path).ok().and_then(|m| FileStat::from_metadata(&m).ok());
                            if stat1.is_some() && stat1 == stat2 {
                                self.sandbox.assert_no_symlink(&path)?;
                                atomic::write_atomic(&path, canonical.as_bytes())?;
                                self.cache.lock().expect("cache poisoned").delete(&path);
                            } else {
                                warn!(?path, "skipped format write: file changed since snapshot");
                            }
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    fn dir_size(path: &Path) -> std::io::Result<u64> {
        let mut total = 0;
        if path.is_dir() {
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    total += Self::dir_size(&entry.path())?;
                } else {
                    total += entry.metadata()?.len();
                }
            }
        } else {
            total += fs::metadata(path)?.len();
        }
        Ok(total)
    }

    pub fn stats(&self, type_filter: Option<&str>) -> Result<StoreStats> {
        let types = match type_filter {
            Some(t) => vec![t.to_string()],
            None => self.discover_types()?,
        };
        let mut stats = StoreStats::default();
        for r#type in types {
            for id in self.list(&r#type)? {
                let key = Key::new(r#type.clone(), id);
                let path = self.primary_path(&key)?;
                let scope = if self.options.sidecar_types.contains(&key.r#type) {
                    path.parent().map(Path::to_path_buf).unwrap_or(path)
                } else {
                    path
                };
                if let Ok(bytes) = Self::dir_size(&scope) {
                    stats.count += 1;
                    stats.total_bytes += bytes;
                }
            }
        }
        Ok(stats)
    }

    pub fn detailed_stats(&self, type_filter: Option<&str>) -> Result<DetailedStats> {
        let types = match type_filter {
            Some(t) => vec![t.to_string()],
            None => self.discover_types()?,
        };
        let mut out = DetailedStats::default();
        for r#type in types {
            let mut per_type_bytes = 0u64;
            for id in self.list(&r#type)? {
                let key = Key::new(r#type.clone(), id);
                let path = self.primary_path(&key)?;
                let scope = if self.options.sidecar_types.contains(&key.r#type) {
                    path.parent().map(Path::to_path_buf).unwrap_or(path)
                } else {
                    path
                };
                if let Ok(bytes) = Self::dir_size(&scope) {
                    out.count += 1;
                    out.total_bytes += bytes;
                    per_type_bytes += bytes;
                    out.min_bytes = Some(out.min_bytes.map_or(bytes, |m| m.min(bytes)));
                    out.max_bytes = Some(out.max_bytes.map_or(bytes, |m| m.max(bytes)));
                }
            }
            out.per_type.insert(r#type, per_type_bytes);
        }
        if out.count > 0 {
            out.avg_bytes = out.total_bytes as f64 / out.count as f64;
        }
        Ok(out)
    }

    /// Read-only sweep: re-parse every document and cross-check every
    /// configured index against a full scan, without mutating anything.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        let format_report = self.format(FormatTarget::All, true, false)?;
        report.format_drift = format_report.changed;
        report.parse_failures = format_report.failures;

        let configured = self
            .configured_indexes
            .lock()
            .expect("configured index table poisoned")
            .clone();
        for (r#type, fields) in configured {
            let docs = self.load_scope_docs(&Some(r#type.clone()))?;
            for field in fields {
                let mut expected: std::collections::BTreeMap<String, Vec<String>> = std::collections::BTreeMap::new();
                for doc in &docs {
                    if let (Some(id), Some(value)) = (doc.get("id").and_then(|v| v.as_str()), get_path(doc, &field)) {
                        for key in crate::index::encode_value_keys(value) {
                            let ids = expected.entry(key).or_default();
                            ids.push(id.to_string());
                        }
                    }
                }
                for ids in expected.values_mut() {
                    ids.sort();
                    ids.dedup();
                }
                let actual = self.index_manager.debug_postings(&r#type, &field)?;
                if actual != expected {
                    report.index_mismatches.push((r#type.clone(), field.clone()));
                }
            }
        }
        Ok(report)
    }

    pub fn read_attachment(&self, key: &Key, field_key: &str) -> Result<String> {
        let doc = self
            .get(key)?
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", key.r#type, key.id)))?;
        let md = doc
            .get("md")
            .and_then(|v| v.as_object())
            .ok_or_else(|| StoreError::NotFound("document has no sidecar references".to_string()))?;
        let entry = md
            .get(field_key)
            .ok_or_else(|| StoreError::NotFound(format!("no such attachment: {field_key}")))?;
        let (rel_path, expected_digest) = parse_md_entry(entry)?;
        let path = self.sandbox.resolve_attachment(key, &rel_path)?;
        self.sandbox.assert_no_symlink(&path)?;
        let content = fs::read_to_string(&path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(format!("attachment not found: {rel_path}")),
            _ => StoreError::Read {
                path: path.clone(),
                source,
            },
        })?;
        if let Some(expected) = expected_digest {
            let actual = blake3::hash(content.as_bytes()).to_hex().to_string();
            if actual != expected {
                return Err(StoreError::Integrity {
                    path,
                    reason: format!("digest mismatch: expected {expected}, got {actual}"),
                });
            }
        }
        Ok(content)
    }

    pub fn write_attachment(&self, key: &Key, rel_path: &str, content: &str) -> Result<()> {
        let path = self.sandbox.resolve_attachment(key, rel_path)?;
        self.sandbox.assert_no_symlink(&path)?;
        atomic::write_atomic(&path, content.as_bytes())
    }

    /// Write a primary record together with sidecar attachments as one
    /// directory transaction: either every file lands together, or none do.
    pub fn put_with_attachments(
        &self,
        key: &Key,
        doc: &Value,
        attachments: &[(String, String)],
    ) -> Result<()> {
        key.validate()?;
        validate_doc_matches_key(doc, key)?;
        let dir = self.sandbox.resolve_sidecar_dir(key)?;
        let canonical = serializer::canonicalize(doc, &self.serialize_options())?;

        let txn = DirTransaction::begin(&dir)?;
        txn.write_file(&format!("{}.{}", key.id, self.options.ext), canonical.as_bytes())?;
        for (name, content) in attachments {
            txn.write_file(name, content.as_bytes())?;
        }
        txn.commit(&self.sandbox)?;
        self.cache
            .lock()
            .expect("cache poisoned")
            .clear(Some(&dir));
        info!(r#type = %key.r#type, id = %key.id, "committed sidecar directory transaction");
        Ok(())
    }

    pub fn close(&self) {
        self.cache.lock().expect("cache poisoned").clear(None);
    }
}

fn slice<T>(items: Vec<T>, skip: usize, limit: Option<usize>) -> Vec<T> {
    let skipped = items.into_iter().skip(skip);
    match limit {
        Some(n) => skipped.take(n).collect(),
        None => skipped.collect(),
    }
}

fn parse_md_entry(v: &Value) -> Result<(String, Option<String>)> {
    match v {
        Value::String(s) => Ok((s.clone(), None)),
        Value::Object(m) => {
            let path = m
                .get("path")
                .and_then(|p| p.as_str())
                .ok_or_else(|| StoreError::Validation("md entry missing 'path'".to_string()))?
                .to_string();
            let digest = m.get("digest").and_then(|d| d.as_str()).map(str::to_string);
            Ok((path, digest))
        }
        _ => Err(StoreError::Validation("md entry must be a string or object".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &Path) -> Store {
        Store::open(StoreOptions::new(dir)).unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let key = Key::new("task", "1");
        let doc = json!({"type": "task", "id": "1", "title": "A"});
        s.put(&key, &doc).unwrap();
        assert_eq!(s.get(&key).unwrap(), Some(doc));
    }

    #[test]
    fn duplicate_put_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let key = Key::new("task", "1");
        let doc = json!({"type": "task", "id": "1", "title": "A"});
        s.put(&key, &doc).unwrap();
        let path = s.primary_path(&key).unwrap();
        let mtime_before = fs::metadata(&path).unwrap().modified().unwrap();
        s.put(&key, &doc).unwrap();
        let mtime_after = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(mtime_before, mtime_after);
    }

    #[test]
    fn remove_is_idempotent_and_get_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let key = Key::new("task", "1");
        s.put(&key, &json!({"type": "task", "id": "1"})).unwrap();
        s.remove(&key).unwrap();
        assert_eq!(s.get(&key).unwrap(), None);
        assert!(s.remove(&key).is_ok());
    }

    #[test]
    fn path_escape_is_rejected_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let key = Key::new("..", "x");
        assert!(s.put(&key, &json!({"type": "..", "id": "x"})).is_err());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn index_correctness_across_put_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = StoreOptions::new(dir.path());
        options.enable_indexes = true;
        let s = Store::open(options).unwrap();

        s.put(&Key::new("task", "t1"), &json!({"type": "task", "id": "t1", "status": "open"}))
            .unwrap();
        s.put(&Key::new("task", "t2"), &json!({"type": "task", "id": "t2", "status": "closed"}))
            .unwrap();
        s.put(&Key::new("task", "t3"), &json!({"type": "task", "id": "t3", "status": "open"}))
            .unwrap();
        s.ensure_index("task", "status").unwrap();

        let spec = QuerySpec {
            r#type: Some("task".into()),
            filter: json!({"status": {"$eq": "open"}}),
            ..Default::default()
        };
        let results = s.query(spec.clone()).unwrap();
        let mut ids: Vec<&str> = results.iter().map(|d| d["id"].as_str().unwrap()).collect();
        ids.sort();
        assert_eq!(ids, vec!["t1", "t3"]);

        s.put(&Key::new("task", "t1"), &json!({"type": "task", "id": "t1", "status": "closed"}))
            .unwrap();
        let results = s.query(spec.clone()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["id"], "t3");

        s.remove(&Key::new("task", "t2")).unwrap();
        let spec_closed = QuerySpec {
            r#type: Some("task".into()),
            filter: json!({"status": {"$eq": "closed"}}),
            ..Default::default()
        };
        let results = s.query(spec_closed).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["id"], "t1");
    }

    #[test]
    fn list_returns_sorted_ids() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.put(&Key::new("task", "b"), &json!({"type": "task", "id": "b"})).unwrap();
        s.put(&Key::new("task", "a"), &json!({"type": "task", "id": "a"})).unwrap();
        assert_eq!(s.list("task").unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn format_dry_run_counts_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let key = Key::new("task", "1");
        let path = s.primary_path(&key).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{\"z\":1,\"type\":\"task\",\"id\":\"1\"}").unwrap();

        let report = s.format(FormatTarget::All, true, false).unwrap();
        assert_eq!(report.changed, 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"z\":1,\"type\":\"task\",\"id\":\"1\"}");

        let report = s.format(FormatTarget::All, false, false).unwrap();
        assert_eq!(report.changed, 1);
        let second = s.format(FormatTarget::All, false, false).unwrap();
        assert_eq!(second.changed, 0);
    }

    #[test]
    fn stats_counts_documents_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        s.put(&Key::new("task", "1"), &json!({"type": "task", "id": "1", "title": "hello"}))
            .unwrap();
        let stats = s.stats(Some("task")).unwrap();
        assert_eq!(stats.count, 1);
        assert!(stats.total_bytes > 0);
    }

    #[test]
    fn sidecar_put_and_attachment_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = StoreOptions::new(dir.path());
        options.sidecar_types.insert("project".to_string());
        let s = Store::open(options).unwrap();

        let key = Key::new("project", "p1");
        let doc = json!({"type": "project", "id": "p1", "md": {"summary": "summary.md"}});
        s.put_with_attachments(&key, &doc, &[("summary.md".to_string(), "hello world".to_string())])
            .unwrap();

        assert_eq!(s.get(&key).unwrap(), Some(doc));
        assert_eq!(s.read_attachment(&key, "summary").unwrap(), "hello world");
    }
}
