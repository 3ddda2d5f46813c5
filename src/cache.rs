//! In-memory response cache keyed by request path.
//!
//! Paths are matched exactly and case-sensitively. A store for an existing
//! path replaces the previous response. There is no expiry and no size
//! bound: an entry lives until it is overwritten or the process exits.
//!
//! The cache is owned by the acceptor and lent to one session at a time,
//! so no locking is needed.

use bytes::Bytes;
use std::collections::HashMap;
use tracing::trace;

/// Hit/miss/store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
}

/// Path-keyed store of raw upstream responses.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: HashMap<String, Bytes>,
    stats: CacheStats,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the response last stored for `path`.
    pub fn get(&mut self, path: &str) -> Option<Bytes> {
        match self.entries.get(path) {
            Some(body) => {
                self.stats.hits += 1;
                trace!(path, bytes = body.len(), "Cache hit");
                Some(body.clone())
            }
            None => {
                self.stats.misses += 1;
                trace!(path, "Cache miss");
                None
            }
        }
    }

    /// Store `body` for `path`, replacing any previous entry.
    ///
    /// Returns true if an existing entry was replaced.
    pub fn put(&mut self, path: &str, body: Bytes) -> bool {
        self.stats.stores += 1;
        trace!(path, bytes = body.len(), "Cache store");
        self.entries.insert(path.to_string(), body).is_some()
    }

    /// Check for an entry without touching the counters.
    #[cfg(test)]
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
