//! Process-wide result cache.
//!
//! Entries are keyed by a SHA-256 over the canonical form of the settled
//! filters and rank spec, bounded by an LRU capacity and expired after a TTL.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::engine::{ResultInputs, ResultRecord};

/// Canonical hash of one filter + rank combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ResultKey(String);

impl ResultKey {
    /// Non-empty fields in chain order with sorted values, then rank position
    /// and rank by. Selection order never reaches the hash.
    pub fn new(inputs: &ResultInputs) -> Self {
        let mut parts: Vec<(&str, Vec<String>)> = inputs
            .selection
            .normalized()
            .into_iter()
            .map(|(field, values)| (field.column(), values))
            .collect();
        parts.push((
            "rank_position",
            vec![inputs.rank.rank_position.as_str().to_string()],
        ));
        parts.push(("rank_by", vec![inputs.rank.rank_by.as_str().to_string()]));

        let mut hasher = Sha256::new();
        for (name, values) in &parts {
            hasher.update(name.as_bytes());
            hasher.update([0x1f]);
            for v in values {
                hasher.update((v.len() as u64).to_le_bytes());
                hasher.update(v.as_bytes());
            }
            hasher.update([0x1e]);
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Accepts a key echoed back by a client. Anything that could not have come
    /// from [`ResultKey::new`] is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct CacheEntry {
    record: Arc<ResultRecord>,
    created_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

pub struct ResultCache {
    inner: Mutex<LruCache<ResultKey, CacheEntry>>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Returns the record for `key` unless it is absent or expired. A hit
    /// promotes the entry to most recently used.
    pub fn get(&self, key: &ResultKey) -> Option<Arc<ResultRecord>> {
        let mut cache = self.inner.lock();
        let expired = cache.get(key)?.is_expired(self.ttl);
        if expired {
            cache.pop(key);
            return None;
        }
        cache.get(key).map(|e| Arc::clone(&e.record))
    }

    /// Last write wins; a key always maps to the same record so overwrites are benign.
    pub fn put(&self, key: ResultKey, record: Arc<ResultRecord>) {
        self.inner.lock().put(
            key,
            CacheEntry {
                record,
                created_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cleanup_expired(&self) -> usize {
        let mut cache = self.inner.lock();
        let expired: Vec<ResultKey> = cache
            .iter()
            .filter(|(_, e)| e.is_expired(self.ttl))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &expired {
            cache.pop(k);
        }
        expired.len()
    }
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
