//! Cached entry with access metadata.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use super::Priority;

/// A cached value plus the metadata the manager needs for expiry, eviction
/// and prefetch decisions.
///
/// Access metadata is atomic so that reads can update it under a shared lock.
#[derive(Debug)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    /// Epoch ms after which the entry is dead.
    pub expiry: i64,
    pub created_at: i64,
    /// Store-assigned identity, unique per insertion.
    pub generation: u64,
    last_accessed: AtomicI64,
    access_count: AtomicU64,
    /// Estimated byte footprint.
    pub size: usize,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub real_time_subscribed: bool,
    pub prefetch_threshold: f64,
}

impl<V> CacheEntry<V> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: String,
        value: V,
        now: i64,
        ttl_ms: i64,
        size: usize,
        priority: Priority,
        tags: Vec<String>,
        real_time_subscribed: bool,
        prefetch_threshold: f64,
    ) -> Self {
        Self {
            key,
            value,
            expiry: now.saturating_add(ttl_ms),
            created_at: now,
            generation: 0,
            last_accessed: AtomicI64::new(now),
            access_count: AtomicU64::new(0),
            size,
            priority,
            tags,
            real_time_subscribed,
            prefetch_threshold,
        }
    }

    /// Whether the entry is dead at `now`.
    #[inline]
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expiry
    }

    /// Record a successful read.
    pub(crate) fn touch(&self, now: i64) {
        self.last_accessed.store(now, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_accessed(&self) -> i64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Fraction of the original TTL already elapsed at `now`, in `0.0..=1.0`.
    pub fn elapsed_fraction(&self, now: i64) -> f64 {
        let ttl = self.expiry - self.created_at;
        if ttl <= 0 {
            return 1.0;
        }
        ((now - self.created_at) as f64 / ttl as f64).clamp(0.0, 1.0)
    }

    /// Whether a refresh should be offered for a read at `now`: the remaining
    /// TTL fraction has fallen to `1 - threshold` or below.
    pub fn in_prefetch_window(&self, now: i64, threshold: f64) -> bool {
        !self.is_expired(now) && self.elapsed_fraction(now) >= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(now: i64, ttl: i64) -> CacheEntry<u32> {
        CacheEntry::new("k".into(), 1, now, ttl, 8, Priority::Medium, vec![], false, 0.8)
    }

    #[test]
    fn test_expiry_is_inclusive() {
        let e = entry(1_000, 500);
        assert!(!e.is_expired(1_499));
        assert!(e.is_expired(1_500));
    }

    #[test]
    fn test_touch_updates_metadata() {
        let e = entry(0, 100);
        e.touch(40);
        e.touch(50);
        assert_eq!(e.last_accessed(), 50);
        assert_eq!(e.access_count(), 2);
    }

    #[test]
    fn test_prefetch_window() {
        let e = entry(0, 1_000);
        // 80% threshold: window opens once 20% or less remains.
        assert!(!e.in_prefetch_window(700, 0.8));
        assert!(e.in_prefetch_window(800, 0.8));
        assert!(e.in_prefetch_window(999, 0.8));
        assert!(!e.in_prefetch_window(1_000, 0.8));
    }
}
