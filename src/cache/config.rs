//! Cache configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Eviction priority of an entry.
///
/// Ordering is significant: eviction removes lower priorities first, so a
/// `Critical` entry is never evicted ahead of a `Low` one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Per-call configuration for cache writes and prefetch checks.
///
/// Calls that pass no config use the manager's defaults.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time-to-live for the entry.
    pub ttl: Duration,

    /// Maximum number of entries in the whole store.
    pub max_size: usize,

    /// Fraction (0..=1) of the TTL that must elapse before a read offers a
    /// background refresh.
    pub prefetch_threshold: f64,

    /// Subscribe the entry to domain events for its tags.
    pub invalidate_on_update: bool,

    pub priority: Priority,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300), // 5 minutes
            max_size: 1_000,
            prefetch_threshold: 0.8,
            invalidate_on_update: true,
            priority: Priority::Medium,
        }
    }
}

impl CacheConfig {
    /// Create a config with the given TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    /// Set time-to-live (builder pattern).
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the prefetch threshold, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn prefetch_threshold(mut self, threshold: f64) -> Self {
        self.prefetch_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn invalidate_on_update(mut self, enabled: bool) -> Self {
        self.invalidate_on_update = enabled;
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Frequently read, frequently changing data.
    /// Short TTL, early refresh.
    pub fn hot_data() -> Self {
        Self {
            ttl: Duration::from_secs(60), // 1 minute
            prefetch_threshold: 0.7,
            priority: Priority::High,
            ..Default::default()
        }
    }

    /// Rarely changing reference data.
    /// Long TTL, low eviction priority.
    pub fn cold_data() -> Self {
        Self {
            ttl: Duration::from_secs(3600), // 1 hour
            priority: Priority::Low,
            ..Default::default()
        }
    }

    /// Per-session views that should not be refreshed in the background.
    pub fn session_data() -> Self {
        Self {
            ttl: Duration::from_secs(1800), // 30 minutes
            prefetch_threshold: 1.0,
            invalidate_on_update: false,
            ..Default::default()
        }
    }

    /// Data that must survive capacity pressure.
    pub fn critical() -> Self {
        Self {
            priority: Priority::Critical,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
        assert!(Priority::High < Priority::Critical);
    }

    #[test]
    fn test_builder_clamps_threshold() {
        let config = CacheConfig::with_ttl(Duration::from_secs(5))
            .prefetch_threshold(1.5)
            .priority(Priority::High);

        assert_eq!(config.ttl, Duration::from_secs(5));
        assert_eq!(config.prefetch_threshold, 1.0);
        assert_eq!(config.priority, Priority::High);
        assert!(config.invalidate_on_update);
    }
}
