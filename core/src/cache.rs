//! Bounded in-memory document cache, keyed by absolute path and validated
//! by `(mtime, size)` against the filesystem on every lookup.
//!
//! Count-capped via `lru::LruCache`, with an additional manual byte-budget
//! eviction loop layered on top for the optional memory cap.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use lru::LruCache;
use serde_json::Value;

/// The `(mtime, size)` pair a cache entry is validated against. Integer
/// nanoseconds and bytes, rather than floats, so a malformed stat can never
/// produce a non-finite value here -- there is no runtime check for it
/// because the type itself rules it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mtime_nanos: i128,
    pub size: u64,
}

impl FileStat {
    pub fn from_metadata(meta: &std::fs::Metadata) -> std::io::Result<Self> {
        let modified = meta.modified()?;
        let nanos = modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i128)
            .unwrap_or(0);
        Ok(Self {
            mtime_nanos: nanos,
            size: meta.len(),
        })
    }
}

struct Entry {
    doc: Arc<Value>,
    stat: FileStat,
    mem_estimate: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct DocumentCache {
    inner: Option<LruCache<PathBuf, Entry>>,
    max_memory_bytes: Option<usize>,
    current_memory_bytes: usize,
    stats: CacheStats,
}

impl DocumentCache {
    /// `max_entries = 0` disables caching entirely: `set` becomes a no-op
    /// and `get` always misses, without allocating a backing map.
    pub fn new(max_entries: usize, max_memory_bytes: Option<usize>) -> Self {
        let inner = NonZeroUsize::new(max_entries).map(LruCache::new);
        Self {
            inner,
            max_memory_bytes,
            current_memory_bytes: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, None)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Hit only if an entry exists and its stored stat equals `current`. A
    /// stale entry is evicted and counted as a miss.
    pub fn get(&mut self, path: &Path, current: FileStat) -> Option<Arc<Value>> {
        let inner = self.inner.as_mut()?;
        let is_stale = match inner.peek(path) {
            Some(entry) => entry.stat != current,
            None => {
                self.stats.misses += 1;
                return None;
            }
        };
        if is_stale {
            if let Some(entry) = inner.pop(path) {
                self.current_memory_bytes =
                    self.current_memory_bytes.saturating_sub(entry.mem_estimate);
            }
            self.stats.misses += 1;
            return None;
        }
        self.stats.hits += 1;
        inner.get(path).map(|e| e.doc.clone())
    }

    /// Insert or replace an entry, evicting LRU entries until both the
    /// count cap and, if set, the memory cap hold.
    pub fn set(&mut self, path: PathBuf, doc: Arc<Value>, stat: FileStat) {
        let Some(inner) = self.inner.as_mut() else {
            return;
        };
        let mem_estimate = estimate_size(&doc);
        if let Some(old) = inner.pop(&path) {
            self.current_memory_bytes = self.current_memory_bytes.saturating_sub(old.mem_estimate);
        } else if inner.len() >= inner.cap().get() {
            if let Some((_, evicted)) = inner.pop_lru() {
                self.current_memory_bytes =
                    self.current_memory_bytes.saturating_sub(evicted.mem_estimate);
                self.stats.evictions += 1;
            }
        }
        inner.put(
            path,
            Entry {
                doc,
                stat,
                mem_estimate,
            },
        );
        self.current_memory_bytes += mem_estimate;
        self.enforce_memory_cap();
    }

    pub fn delete(&mut self, path: &Path) {
        if let Some(inner) = self.inner.as_mut() {
            if let Some(entry) = inner.pop(path) {
                self.current_memory_bytes =
                    self.current_memory_bytes.saturating_sub(entry.mem_estimate);
            }
        }
    }

    /// Remove every entry, or (with `prefix`) only those under that
    /// directory prefix (e.g. `root/type/`).
    pub fn clear(&mut self, prefix: Option<&Path>) {
        let Some(inner) = self.inner.as_mut() else {
            return;
        };
        match prefix {
            None => {
                inner.clear();
                self.current_memory_bytes = 0;
            }
            Some(prefix) => {
                let to_remove: Vec<PathBuf> = inner
                    .iter()
                    .filter(|(path, _)| path.starts_with(prefix))
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in to_remove {
                    if let Some(entry) = inner.pop(&path) {
                        self.current_memory_bytes =
                            self.current_memory_bytes.saturating_sub(entry.mem_estimate);
                    }
                }
            }
        }
    }

    fn enforce_memory_cap(&mut self) {
        let (Some(inner), Some(cap)) = (self.inner.as_mut(), self.max_memory_bytes) else {
            return;
        };
        while self.current_memory_bytes > cap {
            match inner.pop_lru() {
                Some((_, evicted)) => {
                    self.current_memory_bytes =
                        self.current_memory_bytes.saturating_sub(evicted.mem_estimate);
                    self.stats.evictions += 1;
                }
                None => break,
            }
        }
    }
}

fn estimate_size(doc: &Value) -> usize {
    // A cheap, approximate estimate: the serialized byte length plus a
    // constant for the tree's allocation overhead.
    serde_json::to_vec(doc).map(|b| b.len() + 64).unwrap_or(64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stat(mtime: i128, size: u64) -> FileStat {
        FileStat {
            mtime_nanos: mtime,
            size,
        }
    }

    #[test]
    fn disabled_cache_never_hits() {
        let mut cache = DocumentCache::disabled();
        let path = PathBuf::from("/a/b.json");
        cache.set(path.clone(), Arc::new(json!({"a": 1})), stat(1, 10));
        assert!(cache.get(&path, stat(1, 10)).is_none());
    }

    #[test]
    fn hit_requires_matching_stat() {
        let mut cache = DocumentCache::new(10, None);
        let path = PathBuf::from("/a/b.json");
        cache.set(path.clone(), Arc::new(json!({"a": 1})), stat(1, 10));
        assert!(cache.get(&path, stat(1, 10)).is_some());
        assert!(cache.get(&path, stat(2, 10)).is_none());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn stale_entry_is_evicted_on_lookup() {
        let mut cache = DocumentCache::new(10, None);
        let path = PathBuf::from("/a/b.json");
        cache.set(path.clone(), Arc::new(json!({"a": 1})), stat(1, 10));
        assert!(cache.get(&path, stat(2, 10)).is_none());
        // After the stale miss, a fresh set with the new stat should hit.
        cache.set(path.clone(), Arc::new(json!({"a": 2})), stat(2, 10));
        assert!(cache.get(&path, stat(2, 10)).is_some());
    }

    #[test]
    fn count_cap_evicts_lru() {
        let mut cache = DocumentCache::new(2, None);
        cache.set(PathBuf::from("/a"), Arc::new(json!(1)), stat(1, 1));
        cache.set(PathBuf::from("/b"), Arc::new(json!(2)), stat(1, 1));
        // touch /a so /b becomes LRU
        cache.get(&PathBuf::from("/a"), stat(1, 1));
        cache.set(PathBuf::from("/c"), Arc::new(json!(3)), stat(1, 1));
        assert!(cache.get(&PathBuf::from("/b"), stat(1, 1)).is_none());
        assert!(cache.get(&PathBuf::from("/a"), stat(1, 1)).is_some());
        assert!(cache.get(&PathBuf::from("/c"), stat(1, 1)).is_some());
    }

    #[test]
    fn clear_with_prefix_only_removes_matching_entries() {
        let mut cache = DocumentCache::new(10, None);
        cache.set(PathBuf::from("/root/task/1.json"), Arc::new(json!(1)), stat(1, 1));
        cache.set(PathBuf::from("/root/note/1.json"), Arc::new(json!(1)), stat(1, 1));
        cache.clear(Some(Path::new("/root/task")));
        assert!(cache.get(&PathBuf::from("/root/task/1.json"), stat(1, 1)).is_none());
        assert!(cache.get(&PathBuf::from("/root/note/1.json"), stat(1, 1)).is_some());
    }
}
