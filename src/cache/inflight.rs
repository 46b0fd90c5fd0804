//! In-flight prefetch markers backed by Moka.

use std::time::Duration;

use moka::sync::Cache;

/// Tracks keys with a background refresh already running.
///
/// Markers expire on their own after `ttl`, so a fetch that never completes
/// cannot block later refreshes of the same key forever.
#[derive(Clone)]
pub struct InflightSet {
    inner: Cache<String, ()>,
}

impl InflightSet {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Claim `key`. Returns `false` if a refresh is already in flight.
    pub fn try_begin(&self, key: &str) -> bool {
        self.inner.entry(key.to_string()).or_insert(()).is_fresh()
    }

    /// Release the claim on `key`.
    pub fn finish(&self, key: &str) {
        self.inner.invalidate(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }
}

impl std::fmt::Debug for InflightSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightSet")
            .field("entry_count", &self.inner.entry_count())
            .finish()
    }
}
