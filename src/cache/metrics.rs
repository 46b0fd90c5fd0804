//! Cache counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters, updated without locking.
#[derive(Debug, Default)]
pub(crate) struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub sets: AtomicU64,
    pub evictions: AtomicU64,
    pub invalidations: AtomicU64,
    pub cleaned: AtomicU64,
    pub prefetches: AtomicU64,
    pub prefetch_failures: AtomicU64,
    pub prefetch_opportunities: AtomicU64,
}

impl CacheMetrics {
    #[inline]
    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.sets,
            &self.evictions,
            &self.invalidations,
            &self.cleaned,
            &self.prefetches,
            &self.prefetch_failures,
            &self.prefetch_opportunities,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, entry_count: usize, total_size_bytes: usize) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            hits: load(&self.hits),
            misses: load(&self.misses),
            sets: load(&self.sets),
            evictions: load(&self.evictions),
            invalidations: load(&self.invalidations),
            cleaned: load(&self.cleaned),
            prefetches: load(&self.prefetches),
            prefetch_failures: load(&self.prefetch_failures),
            prefetch_opportunities: load(&self.prefetch_opportunities),
            entry_count,
            total_size_bytes,
        }
    }
}

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub cleaned: u64,
    pub prefetches: u64,
    pub prefetch_failures: u64,
    /// Result of the most recent prefetch monitoring pass.
    pub prefetch_opportunities: u64,
    pub entry_count: usize,
    pub total_size_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
