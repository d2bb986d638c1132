//! Freshness-aware module cache.
//!
//! Compiled payloads are keyed by request path and stored with the
//! modification time of the source they were computed from. A lookup may
//! stat the live file and refuse an entry whose source has moved on.
//!
//! The cache is bounded by weight rather than entry count; every resource
//! kind shares one keyspace and one LRU order.

use std::time::SystemTime;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::source::ResourceReader;
use crate::Payload;

/// Weight of one entry: payload counted twice (UTF-16 estimate) plus key.
pub fn entry_weight(key: &str, payload: &str) -> usize {
    payload.len().saturating_mul(2).saturating_add(key.len())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Payload,
    /// `None` for entries with no backing file (virtual packages).
    source_timestamp: Option<SystemTime>,
}

#[derive(Debug)]
struct CacheInner {
    lru: LruCache<String, CacheEntry>,
    weight: usize,
}

/// Bounded key → payload store with mtime-based staleness checks.
#[derive(Debug)]
pub struct ModuleCache {
    inner: Mutex<CacheInner>,
    max_weight: usize,
    reader: ResourceReader,
}

impl ModuleCache {
    /// Create an empty cache. `reader` locates the backing file of a key.
    pub fn new(reader: ResourceReader, max_weight: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::unbounded(),
                weight: 0,
            }),
            max_weight,
            reader,
        }
    }

    /// Look up `key`.
    ///
    /// With `check_freshness`, a file-backed entry is only returned while
    /// the live file is not newer than the entry's timestamp. A file that
    /// can no longer be stat'ed is a miss, so the caller recomputes and
    /// surfaces the real error.
    pub async fn try_get(&self, key: &str, check_freshness: bool) -> Option<Payload> {
        let entry = {
            let mut guard = self.inner.lock();
            guard.lru.get(key).cloned()
        }?;

        if check_freshness {
            if let Some(cached_at) = entry.source_timestamp {
                match self.reader.modified(key).await {
                    Ok(live) if live > cached_at => {
                        debug!(key, "cache entry stale");
                        return None;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!(key, error = %err, "cache entry source unavailable");
                        return None;
                    }
                }
            }
        }

        trace!(key, "cache hit");
        Some(entry.payload)
    }

    /// Store `payload` under `key`. Returns whether a write happened.
    ///
    /// An identical payload is not rewritten and not promoted, but its
    /// timestamp still advances so a touched-but-unchanged file stops
    /// looking stale. A payload heavier than the whole cache is never
    /// stored, and any older value for the key is dropped.
    pub fn put(&self, key: &str, payload: Payload, source_timestamp: Option<SystemTime>) -> bool {
        let weight = entry_weight(key, &payload);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(existing) = inner.lru.peek_mut(key) {
            if existing.payload == payload {
                if source_timestamp.is_some() {
                    existing.source_timestamp = source_timestamp;
                }
                return false;
            }
        }

        if weight > self.max_weight {
            debug!(key, weight, max = self.max_weight, "payload too large to cache");
            if let Some(old) = inner.lru.pop(key) {
                inner.weight = inner
                    .weight
                    .saturating_sub(entry_weight(key, &old.payload));
            }
            return false;
        }

        let entry = CacheEntry {
            payload,
            source_timestamp,
        };
        if let Some(old) = inner.lru.put(key.to_string(), entry) {
            inner.weight = inner
                .weight
                .saturating_sub(entry_weight(key, &old.payload));
        }
        inner.weight = inner.weight.saturating_add(weight);

        while inner.weight > self.max_weight {
            match inner.lru.pop_lru() {
                Some((evicted_key, evicted)) => {
                    inner.weight = inner
                        .weight
                        .saturating_sub(entry_weight(&evicted_key, &evicted.payload));
                    debug!(key = %evicted_key, "evicted from cache");
                }
                None => break,
            }
        }

        true
    }

    /// Whether `key` is present, ignoring freshness. Does not promote.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().lru.contains(key)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summed weight of all entries.
    pub fn weight(&self) -> usize {
        self.inner.lock().weight
    }

    pub fn max_weight(&self) -> usize {
        self.max_weight
    }
}
