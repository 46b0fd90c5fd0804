//! Real-time aware cache manager.
//!
//! Values live in a single [`BoundedStore`] behind a read-write lock. Reads
//! take the shared lock and update access metadata atomically; writes,
//! eviction, invalidation and sweeps take the exclusive lock for one pass.
//!
//! Entries are tagged from their key. Tags of entries stored with
//! `invalidate_on_update` are subscribed on the event bus, one subscription
//! per tag, so a `<tag>_updated` event invalidates exactly the subscribed
//! keys under that tag.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::CacheConfig;
use super::entry::CacheEntry;
use super::inflight::InflightSet;
use super::metrics::{CacheMetrics, CacheStats};
use super::store::BoundedStore;
use super::tags::{DomainTagExtractor, TagExtractor, TagIndex};
use crate::clock::{SharedClock, SystemClock, duration_ms};
use crate::events::{self, DomainEvent, EventBus, EventHandler, SubscriptionId};
use crate::tasks::BackgroundTasks;

/// Size assumed for values that fail to serialize.
pub const DEFAULT_SIZE_ESTIMATE: usize = 1024;

/// Entries read more often than this count as frequently accessed.
pub const FREQUENT_ACCESS_THRESHOLD: u64 = 5;

/// Fraction of the store removed by one eviction pass.
const EVICTION_FRACTION: f64 = 0.25;

/// Lifetime of an in-flight prefetch marker.
const INFLIGHT_TTL: Duration = Duration::from_secs(30);

/// What to remove in [`CacheManager::invalidate`].
#[derive(Debug, Clone)]
pub enum Invalidation {
    /// One exact key.
    Key(String),
    /// Several exact keys.
    Keys(Vec<String>),
    /// Every key the pattern matches.
    Pattern(Regex),
    /// Every entry whose tags intersect the list.
    Tags(Vec<String>),
}

impl From<&str> for Invalidation {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<String> for Invalidation {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<Regex> for Invalidation {
    fn from(pattern: Regex) -> Self {
        Self::Pattern(pattern)
    }
}

impl From<&[&str]> for Invalidation {
    fn from(tags: &[&str]) -> Self {
        Self::Tags(tags.iter().map(|t| t.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Invalidation {
    fn from(tags: [&str; N]) -> Self {
        Self::Tags(tags.iter().map(|t| t.to_string()).collect())
    }
}

/// Action reported in a [`CacheBroadcast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheAction {
    Set,
    Invalidate,
    Clear,
}

/// Advisory message published on [`events::SYNC_TOPIC`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheBroadcast {
    /// Key, pattern or tag list that was affected.
    pub target: String,
    pub action: CacheAction,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
}

/// Estimate the byte footprint of a value from its JSON encoding.
pub fn estimate_size<V: Serialize>(value: &V) -> usize {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len())
        .unwrap_or(DEFAULT_SIZE_ESTIMATE)
}

/// Everything guarded by the store lock.
struct CacheState<V> {
    store: BoundedStore<CacheEntry<V>>,
    /// Tag index over every entry.
    tags: TagIndex,
    /// Tag index over entries subscribed to domain events.
    live_tags: TagIndex,
    subscriptions: HashMap<String, SubscriptionId>,
    /// Live tags that gained their first key or lost their last one since
    /// subscriptions were last synced.
    touched_tags: HashSet<String>,
    next_generation: u64,
}

impl<V> CacheState<V> {
    fn new(capacity: usize) -> Self {
        Self {
            store: BoundedStore::new(capacity),
            tags: TagIndex::default(),
            live_tags: TagIndex::default(),
            subscriptions: HashMap::new(),
            touched_tags: HashSet::new(),
            next_generation: 0,
        }
    }

    fn insert_entry(&mut self, mut entry: CacheEntry<V>) {
        self.next_generation += 1;
        entry.generation = self.next_generation;

        self.tags.add(&entry.key, &entry.tags);
        if entry.real_time_subscribed {
            let fresh = self.live_tags.add(&entry.key, &entry.tags);
            self.touched_tags.extend(fresh);
        }
        self.store.insert(entry.key.clone(), entry);
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.store.remove(key)?;
        self.tags.remove(key, &entry.tags);
        if entry.real_time_subscribed {
            let emptied = self.live_tags.remove(key, &entry.tags);
            self.touched_tags.extend(emptied);
        }
        Some(entry)
    }

    /// Generation of the entry stored under `key`, expired or not.
    fn generation_of(&self, key: &str) -> Option<u64> {
        self.store.get(key).map(|entry| entry.generation)
    }

    /// Remove the lowest `(priority, last_accessed)` quarter of the store.
    fn evict_pass(&mut self) -> usize {
        let len = self.store.len();
        if len == 0 {
            return 0;
        }

        let mut order: Vec<_> = self
            .store
            .iter()
            .map(|(key, entry)| (entry.priority, entry.last_accessed(), key.clone()))
            .collect();
        order.sort();

        let count = ((len as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
        for (_, _, key) in order.into_iter().take(count) {
            self.remove_entry(&key);
        }
        count
    }

    fn total_size(&self) -> usize {
        self.store.iter().map(|(_, e)| e.size).sum()
    }
}

struct Inner<V> {
    state: RwLock<CacheState<V>>,
    defaults: CacheConfig,
    extractor: Arc<dyn TagExtractor>,
    bus: Option<Arc<dyn EventBus>>,
    clock: SharedClock,
    inflight: InflightSet,
    metrics: CacheMetrics,
    tasks: BackgroundTasks,
    sweep_interval: Duration,
    prefetch_scan_interval: Duration,
}

/// Builder for [`CacheManager`].
pub struct CacheManagerBuilder<V> {
    defaults: CacheConfig,
    extractor: Arc<dyn TagExtractor>,
    bus: Option<Arc<dyn EventBus>>,
    clock: SharedClock,
    sweep_interval: Duration,
    prefetch_scan_interval: Duration,
    _value: PhantomData<fn() -> V>,
}

impl<V> Default for CacheManagerBuilder<V> {
    fn default() -> Self {
        Self {
            defaults: CacheConfig::default(),
            extractor: Arc::new(DomainTagExtractor::default()),
            bus: None,
            clock: Arc::new(SystemClock),
            sweep_interval: Duration::from_secs(60),
            prefetch_scan_interval: Duration::from_secs(30),
            _value: PhantomData,
        }
    }
}

impl<V> CacheManagerBuilder<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    /// Config used by calls that pass none.
    #[must_use]
    pub fn defaults(mut self, config: CacheConfig) -> Self {
        self.defaults = config;
        self
    }

    #[must_use]
    pub fn tag_extractor(mut self, extractor: impl TagExtractor + 'static) -> Self {
        self.extractor = Arc::new(extractor);
        self
    }

    #[must_use]
    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn prefetch_scan_interval(mut self, interval: Duration) -> Self {
        self.prefetch_scan_interval = interval;
        self
    }

    pub fn build(self) -> CacheManager<V> {
        CacheManager {
            inner: Arc::new(Inner {
                state: RwLock::new(CacheState::new(self.defaults.max_size)),
                inflight: InflightSet::new(self.defaults.max_size.max(1) as u64, INFLIGHT_TTL),
                defaults: self.defaults,
                extractor: self.extractor,
                bus: self.bus,
                clock: self.clock,
                metrics: CacheMetrics::default(),
                tasks: BackgroundTasks::new("cache"),
                sweep_interval: self.sweep_interval,
                prefetch_scan_interval: self.prefetch_scan_interval,
            }),
        }
    }
}

/// TTL cache with priority-aware eviction, stale-while-revalidate prefetch
/// and event-driven invalidation.
///
/// Cloning is cheap and shares the same store.
pub struct CacheManager<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CacheManager<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> CacheManager<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    pub fn builder() -> CacheManagerBuilder<V> {
        CacheManagerBuilder::default()
    }

    /// Manager with default settings and no event bus.
    pub fn new(defaults: CacheConfig) -> Self {
        Self::builder().defaults(defaults).build()
    }

    /// Start the expiry sweep and prefetch monitor.
    ///
    /// Calling `init` on a running manager does nothing.
    pub fn init(&self) {
        if !self.inner.tasks.is_empty() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .tasks
            .spawn_periodic("expiry_sweep", self.inner.sweep_interval, move || {
                let manager = upgrade(&weak);
                async move {
                    if let Some(manager) = manager {
                        manager.sweep_expired();
                    }
                }
            });

        let weak = Arc::downgrade(&self.inner);
        self.inner.tasks.spawn_periodic(
            "prefetch_monitor",
            self.inner.prefetch_scan_interval,
            move || {
                let manager = upgrade(&weak);
                async move {
                    if let Some(manager) = manager {
                        manager.scan_prefetch_opportunities();
                    }
                }
            },
        );

        info!(
            "Cache manager started (sweep every {:?}, prefetch scan every {:?})",
            self.inner.sweep_interval, self.inner.prefetch_scan_interval
        );
    }

    /// Stop background tasks and drop every event subscription.
    pub async fn shutdown(&self) {
        self.inner.tasks.shutdown().await;

        if let Some(bus) = &self.inner.bus {
            let mut state = self.inner.state.write();
            for (_, id) in state.subscriptions.drain() {
                bus.unsubscribe(id);
            }
            // Resubscribe live tags on the next write.
            let live: Vec<String> = state.live_tags.tags().cloned().collect();
            state.touched_tags.extend(live);
        }

        info!("Cache manager stopped");
    }

    fn now(&self) -> i64 {
        self.inner.clock.now_ms()
    }

    /// Read a live value.
    pub fn get(&self, key: &str) -> Option<V> {
        self.lookup(key, None).map(|(value, _)| value)
    }

    /// Read a value, falling back to `fetch` on a miss.
    ///
    /// On a hit inside the prefetch window, `fetch` runs in the background
    /// and the current (stale) value is returned immediately. Fetch errors
    /// never reach the caller: a failed miss returns `None`, a failed
    /// prefetch leaves the entry untouched.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        config: Option<&CacheConfig>,
    ) -> Option<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let threshold = config.map(|c| c.prefetch_threshold);

        if let Some((value, refresh)) = self.lookup(key, threshold) {
            if let Some((refresh_config, generation)) = refresh {
                let config = config.cloned().unwrap_or(refresh_config);
                self.spawn_prefetch(key, generation, fetch, config);
            }
            return Some(value);
        }

        match fetch().await {
            Ok(value) => {
                self.set(key, value.clone(), config);
                Some(value)
            }
            Err(e) => {
                debug!("Fetch for {} failed on miss: {}", key, e);
                None
            }
        }
    }

    /// Look up a live entry, recording the hit or miss.
    ///
    /// When `prefetch_threshold` resolves to a refresh, the second element
    /// carries the config to re-store the entry with and the generation of
    /// the entry being refreshed.
    fn lookup(&self, key: &str, prefetch_threshold: Option<f64>) -> Option<(V, Option<(CacheConfig, u64)>)> {
        let now = self.now();
        let state = self.inner.state.read();

        match state.store.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.touch(now);
                CacheMetrics::add(&self.inner.metrics.hits, 1);
                debug!(event = "cache_hit", "Cache hit for {}", key);

                let threshold = prefetch_threshold.unwrap_or(entry.prefetch_threshold);
                let refresh = entry
                    .in_prefetch_window(now, threshold)
                    .then(|| (self.config_of(entry), entry.generation));

                Some((entry.value.clone(), refresh))
            }
            _ => {
                CacheMetrics::add(&self.inner.metrics.misses, 1);
                debug!(event = "cache_miss", "Cache miss for {}", key);
                None
            }
        }
    }

    /// Config that re-creates an entry with its original settings.
    fn config_of(&self, entry: &CacheEntry<V>) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_millis((entry.expiry - entry.created_at).max(0) as u64),
            max_size: self.inner.defaults.max_size,
            prefetch_threshold: entry.prefetch_threshold,
            invalidate_on_update: entry.real_time_subscribed,
            priority: entry.priority,
        }
    }

    /// Refresh `key` in the background. The result is only stored while the
    /// entry is still the one read at `generation`; a refresh that raced an
    /// invalidation or a newer write is dropped.
    fn spawn_prefetch<F, Fut>(&self, key: &str, generation: u64, fetch: F, config: CacheConfig)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        if !self.inner.inflight.try_begin(key) {
            debug!("Prefetch for {} already in flight", key);
            return;
        }

        let manager = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            match fetch().await {
                Ok(value) => {
                    if manager.store_value(&key, value, Some(&config), Some(generation)) {
                        CacheMetrics::add(&manager.inner.metrics.prefetches, 1);
                        debug!(event = "cache_prefetched", "Prefetched {}", key);
                    } else {
                        debug!(
                            event = "prefetch_discarded",
                            "Discarded prefetch for {}: entry changed while fetching", key
                        );
                    }
                }
                Err(e) => {
                    CacheMetrics::add(&manager.inner.metrics.prefetch_failures, 1);
                    warn!("Prefetch for {} failed, keeping current value: {}", key, e);
                }
            }
            manager.inner.inflight.finish(&key);
        });
    }

    /// Store `value` under `key`, replacing any existing entry.
    pub fn set(&self, key: &str, value: V, config: Option<&CacheConfig>) {
        self.store_value(key, value, config, None);
    }

    /// Insert a new entry for `key`. With `expected`, nothing is written
    /// unless the stored entry still carries that generation. Returns whether
    /// the value was stored.
    fn store_value(&self, key: &str, value: V, config: Option<&CacheConfig>, expected: Option<u64>) -> bool {
        let config = config.unwrap_or(&self.inner.defaults);
        let now = self.now();
        let size = estimate_size(&value);
        let tags = self.inner.extractor.tags_for(key);
        let subscribed = config.invalidate_on_update && self.inner.bus.is_some();

        let entry = CacheEntry::new(
            key.to_string(),
            value,
            now,
            duration_ms(config.ttl),
            size,
            config.priority,
            tags,
            subscribed,
            config.prefetch_threshold,
        );

        let evicted = {
            let mut state = self.inner.state.write();
            if expected.is_some() && state.generation_of(key) != expected {
                return false;
            }

            state.remove_entry(key);
            state.store.set_capacity(config.max_size);

            let mut evicted = 0;
            while state.store.is_full() {
                evicted += state.evict_pass();
            }

            state.insert_entry(entry);
            self.sync_subscriptions(&mut state);
            evicted
        };

        if evicted > 0 {
            CacheMetrics::add(&self.inner.metrics.evictions, evicted);
            debug!(event = "cache_evicted", "Evicted {} entries to make room for {}", evicted, key);
        }

        CacheMetrics::add(&self.inner.metrics.sets, 1);
        debug!(event = "cache_set", "Cached {} ({} bytes)", key, size);

        self.broadcast(CacheBroadcast {
            target: key.to_string(),
            action: CacheAction::Set,
            timestamp: now,
            count: None,
            size: Some(size),
        });

        true
    }

    /// Remove every entry matching `target`. Returns the number removed.
    pub fn invalidate(&self, target: impl Into<Invalidation>) -> usize {
        let target = target.into();

        let count = {
            let mut state = self.inner.state.write();
            let keys: Vec<String> = match &target {
                Invalidation::Key(key) => vec![key.clone()],
                Invalidation::Keys(keys) => keys.clone(),
                Invalidation::Pattern(pattern) => state
                    .store
                    .keys()
                    .filter(|key| pattern.is_match(key))
                    .cloned()
                    .collect(),
                Invalidation::Tags(tags) => state
                    .store
                    .iter()
                    .filter(|(_, entry)| entry.tags.iter().any(|t| tags.contains(t)))
                    .map(|(key, _)| key.clone())
                    .collect(),
            };

            let removed = keys
                .iter()
                .filter(|key| state.remove_entry(key).is_some())
                .count();
            self.sync_subscriptions(&mut state);
            removed
        };

        if count > 0 {
            CacheMetrics::add(&self.inner.metrics.invalidations, count);
            info!(event = "cache_invalidated", "Invalidated {} entries for {}", count, describe(&target));

            self.broadcast(CacheBroadcast {
                target: describe(&target),
                action: CacheAction::Invalidate,
                timestamp: self.now(),
                count: Some(count),
                size: None,
            });
        }

        count
    }

    /// Remove everything. Returns the number of entries dropped.
    pub fn clear(&self) -> usize {
        let count = {
            let mut state = self.inner.state.write();
            let count = state.store.drain().len();
            let live: Vec<String> = state.live_tags.tags().cloned().collect();
            state.touched_tags.extend(live);
            state.tags.clear();
            state.live_tags.clear();
            self.sync_subscriptions(&mut state);
            count
        };

        info!("Cleared cache ({} entries)", count);
        self.broadcast(CacheBroadcast {
            target: "*".to_string(),
            action: CacheAction::Clear,
            timestamp: self.now(),
            count: Some(count),
            size: None,
        });

        count
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.now();

        let removed = {
            let mut state = self.inner.state.write();
            let expired: Vec<String> = state
                .store
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();

            for key in &expired {
                state.remove_entry(key);
            }
            self.sync_subscriptions(&mut state);
            expired.len()
        };

        if removed > 0 {
            CacheMetrics::add(&self.inner.metrics.cleaned, removed);
            debug!(event = "cache_cleaned", "Swept {} expired entries", removed);
        }

        removed
    }

    /// Count frequently read entries that are inside their prefetch window.
    pub fn scan_prefetch_opportunities(&self) -> usize {
        let now = self.now();

        let count = self
            .inner
            .state
            .read()
            .store
            .iter()
            .filter(|(_, entry)| {
                entry.access_count() > FREQUENT_ACCESS_THRESHOLD
                    && entry.in_prefetch_window(now, entry.prefetch_threshold)
            })
            .count();

        self.inner
            .metrics
            .prefetch_opportunities
            .store(count as u64, std::sync::atomic::Ordering::Relaxed);

        if count > 0 {
            debug!(event = "prefetch_opportunities", "{} entries are due for refresh", count);
        }

        count
    }

    /// Whether a live entry exists for `key`. Does not count as a read.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.now();
        self.inner
            .state
            .read()
            .store
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.inner.state.read().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tags currently subscribed on the event bus.
    pub fn subscribed_tags(&self) -> Vec<String> {
        let mut tags: Vec<_> = self.inner.state.read().subscriptions.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.read();
        self.inner.metrics.snapshot(state.store.len(), state.total_size())
    }

    /// Zero every counter. Stored entries are untouched.
    pub fn reset_stats(&self) {
        self.inner.metrics.reset();
    }

    /// Subscribe tags that gained their first live key and release tags
    /// that lost their last one, keeping one subscription per live tag.
    fn sync_subscriptions(&self, state: &mut CacheState<V>) {
        let touched = std::mem::take(&mut state.touched_tags);
        let Some(bus) = &self.inner.bus else {
            return;
        };

        for tag in touched {
            let live = state.live_tags.has_tag(&tag);
            match state.subscriptions.get(&tag).copied() {
                Some(id) if !live => {
                    state.subscriptions.remove(&tag);
                    bus.unsubscribe(id);
                    debug!("Unsubscribed from {}", events::update_topic(&tag));
                }
                None if live => {
                    let topic = events::update_topic(&tag);
                    let id = bus.subscribe(&topic, self.event_handler(tag.clone()));
                    debug!("Subscribed to {}", topic);
                    state.subscriptions.insert(tag, id);
                }
                _ => {}
            }
        }
    }

    fn event_handler(&self, tag: String) -> EventHandler {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |event: &DomainEvent| {
            if let Some(manager) = upgrade(&weak) {
                manager.handle_domain_event(&tag, event);
            }
        })
    }

    /// Invalidate the subscribed keys under `tag`, narrowed to the event's
    /// entity when it names one.
    fn handle_domain_event(&self, tag: &str, event: &DomainEvent) -> usize {
        let keys: Vec<String> = self
            .inner
            .state
            .read()
            .live_tags
            .keys_for(tag)
            .into_iter()
            .filter(|key| match &event.entity_id {
                Some(id) => key.split(':').any(|segment| segment == id),
                None => true,
            })
            .collect();

        if keys.is_empty() {
            return 0;
        }

        debug!("Event {} invalidates {} keys", event.topic, keys.len());
        self.invalidate(Invalidation::Keys(keys))
    }

    fn broadcast(&self, message: CacheBroadcast) {
        let Some(bus) = &self.inner.bus else {
            return;
        };

        match serde_json::to_value(&message) {
            Ok(payload) => {
                bus.publish(DomainEvent::new(events::SYNC_TOPIC, message.timestamp).payload(payload));
            }
            Err(e) => debug!("Skipping cache broadcast: {}", e),
        }
    }
}

fn upgrade<V>(weak: &Weak<Inner<V>>) -> Option<CacheManager<V>> {
    weak.upgrade().map(|inner| CacheManager { inner })
}

fn describe(target: &Invalidation) -> String {
    match target {
        Invalidation::Key(key) => key.clone(),
        Invalidation::Keys(keys) => keys.join(","),
        Invalidation::Pattern(pattern) => pattern.as_str().to_string(),
        Invalidation::Tags(tags) => format!("tags:{}", tags.join(",")),
    }
}

impl<V> std::fmt::Debug for CacheManager<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("CacheManager")
            .field("entry_count", &state.store.len())
            .field("capacity", &state.store.capacity())
            .field("subscriptions", &state.subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Priority;
    use crate::clock::ManualClock;
    use crate::events::InProcessBus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manual_manager(clock: &Arc<ManualClock>) -> CacheManager<String> {
        CacheManager::builder().clock(clock.clone()).build()
    }

    fn bus_manager(clock: &Arc<ManualClock>, bus: &Arc<InProcessBus>) -> CacheManager<String> {
        CacheManager::builder()
            .clock(clock.clone())
            .event_bus(bus.clone())
            .build()
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let clock = ManualClock::new(0);
        let cache = manual_manager(&clock);

        cache.set("property:42", "X".to_string(), None);
        assert_eq!(cache.get("property:42"), Some("X".to_string()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_size_bytes, estimate_size(&"X".to_string()));
    }

    #[test]
    fn test_expired_entry_is_absent_before_sweep() {
        let clock = ManualClock::new(0);
        let cache = manual_manager(&clock);
        let config = CacheConfig::with_ttl(Duration::from_millis(1000));

        cache.set("property:1", "v".to_string(), Some(&config));
        clock.advance(Duration::from_millis(999));
        assert!(cache.get("property:1").is_some());

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get("property:1"), None);
        assert!(!cache.contains("property:1"));

        // Still physically stored until the sweep runs.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().cleaned, 1);
    }

    #[test]
    fn test_set_replaces_entry() {
        let clock = ManualClock::new(0);
        let cache = manual_manager(&clock);

        cache.set("user:1", "old".to_string(), None);
        cache.set("user:1", "new".to_string(), None);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("user:1"), Some("new".to_string()));
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let clock = ManualClock::new(0);
        let config = CacheConfig::default().max_size(8);
        let cache: CacheManager<u32> = CacheManager::builder()
            .clock(clock.clone())
            .defaults(config)
            .build();

        for i in 0..50 {
            clock.advance(Duration::from_millis(1));
            cache.set(&format!("k{i}"), i, None);
            assert!(cache.len() <= 8);
        }
        assert!(cache.stats().evictions > 0);
        // The most recent write always survives.
        assert_eq!(cache.get("k49"), Some(49));
    }

    #[test]
    fn test_eviction_prefers_low_priority_over_recency() {
        let clock = ManualClock::new(0);
        let cache: CacheManager<u32> = CacheManager::builder().clock(clock.clone()).build();
        let max = CacheConfig::default().max_size(4);

        // Critical entries are the oldest and never read again.
        cache.set("crit:a", 1, Some(&max.clone().priority(Priority::Critical)));
        cache.set("crit:b", 2, Some(&max.clone().priority(Priority::Critical)));

        clock.advance(Duration::from_secs(10));
        cache.set("low:a", 3, Some(&max.clone().priority(Priority::Low)));
        cache.set("low:b", 4, Some(&max.clone().priority(Priority::Low)));
        clock.advance(Duration::from_secs(10));
        cache.get("low:b");

        // Store is full: one pass removes ceil(4 * 0.25) = 1 entry.
        cache.set("high:a", 5, Some(&max.clone().priority(Priority::High)));

        assert_eq!(cache.len(), 4);
        assert!(cache.contains("crit:a"));
        assert!(cache.contains("crit:b"));
        assert!(cache.contains("high:a"));
        // Least recently used low entry goes first.
        assert!(!cache.contains("low:a"));
        assert!(cache.contains("low:b"));
    }

    #[test]
    fn test_invalidate_exact_key_is_idempotent() {
        let clock = ManualClock::new(0);
        let cache = manual_manager(&clock);

        cache.set("document:9", "doc".to_string(), None);
        assert_eq!(cache.invalidate("document:9"), 1);
        assert_eq!(cache.invalidate("document:9"), 0);
        assert_eq!(cache.invalidate("missing"), 0);
    }

    #[test]
    fn test_invalidate_by_pattern() {
        let clock = ManualClock::new(0);
        let cache = manual_manager(&clock);

        cache.set("payment:1", "a".to_string(), None);
        cache.set("payment:2", "b".to_string(), None);
        cache.set("offer:1", "c".to_string(), None);

        let pattern = Regex::new(r"^payment:\d+$").unwrap();
        assert_eq!(cache.invalidate(pattern), 2);
        assert!(cache.contains("offer:1"));
    }

    #[test]
    fn test_invalidate_by_tags_is_exact() {
        let clock = ManualClock::new(0);
        let cache = manual_manager(&clock);

        cache.set("property:1", "a".to_string(), None);
        cache.set("property:2:documents", "b".to_string(), None);
        cache.set("user:5", "c".to_string(), None);
        cache.set("health", "d".to_string(), None);

        assert_eq!(cache.invalidate(["property"]), 2);
        assert_eq!(cache.invalidate(["property"]), 0);
        assert!(cache.contains("user:5"));
        assert!(cache.contains("health"));

        assert_eq!(cache.invalidate(["user", "document"]), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_property_scenario() {
        let clock = ManualClock::new(0);
        let cache = manual_manager(&clock);

        let short = CacheConfig::with_ttl(Duration::from_millis(1000));
        cache.set("property:42", "listing".to_string(), Some(&short));
        clock.advance(Duration::from_millis(1100));
        assert_eq!(cache.get("property:42"), None);

        cache.set("property:42", "X".to_string(), None);
        assert_eq!(cache.get("property:42"), Some("X".to_string()));
        assert_eq!(cache.invalidate(["property"]), 1);
        assert_eq!(cache.get("property:42"), None);
    }

    #[test]
    fn test_custom_tag_extractor() {
        let clock = ManualClock::new(0);
        let cache: CacheManager<String> = CacheManager::builder()
            .clock(clock.clone())
            .tag_extractor(|key: &str| vec![format!("prefix:{}", key.split('/').next().unwrap_or(""))])
            .build();

        cache.set("listings/1", "a".to_string(), None);
        cache.set("agents/1", "b".to_string(), None);

        assert_eq!(cache.invalidate(["prefix:listings"]), 1);
        assert!(cache.contains("agents/1"));
    }

    #[test]
    fn test_domain_event_invalidates_subscribed_keys() {
        let clock = ManualClock::new(0);
        let bus = InProcessBus::new();
        let cache = bus_manager(&clock, &bus);

        cache.set("property:42", "a".to_string(), None);
        cache.set("property:43", "b".to_string(), None);
        cache.set(
            "property:44",
            "c".to_string(),
            Some(&CacheConfig::default().invalidate_on_update(false)),
        );

        assert_eq!(cache.subscribed_tags(), vec!["property"]);
        assert_eq!(bus.subscriber_count("property_updated"), 1);

        // Targeted event only removes the named record.
        bus.publish(DomainEvent::new("property_updated", 0).entity("42"));
        assert!(!cache.contains("property:42"));
        assert!(cache.contains("property:43"));

        // Duplicate delivery is harmless.
        bus.publish(DomainEvent::new("property_updated", 0).entity("42"));

        // Untargeted event removes every subscribed key, not opted-out ones.
        bus.publish(DomainEvent::new("property_updated", 0));
        assert!(!cache.contains("property:43"));
        assert!(cache.contains("property:44"));

        // Last subscribed key gone: the subscription is released.
        assert!(cache.subscribed_tags().is_empty());
        assert_eq!(bus.subscriber_count("property_updated"), 0);
    }

    #[test]
    fn test_one_subscription_per_tag() {
        let clock = ManualClock::new(0);
        let bus = InProcessBus::new();
        let cache = bus_manager(&clock, &bus);

        for i in 0..10 {
            cache.set(&format!("transaction:{i}"), i.to_string(), None);
        }
        assert_eq!(bus.subscriber_count("transaction_updated"), 1);

        cache.invalidate("transaction:0");
        assert_eq!(bus.subscriber_count("transaction_updated"), 1);

        cache.clear();
        assert_eq!(bus.subscriber_count("transaction_updated"), 0);
    }

    #[test]
    fn test_subscription_follows_entry_replacement_and_sweep() {
        let clock = ManualClock::new(0);
        let bus = InProcessBus::new();
        let cache = bus_manager(&clock, &bus);

        cache.set("offer:1", "a".to_string(), None);
        assert_eq!(bus.subscriber_count("offer_updated"), 1);

        // Replacing the key with an opted-out entry empties the live tag.
        cache.set(
            "offer:1",
            "b".to_string(),
            Some(&CacheConfig::default().invalidate_on_update(false)),
        );
        assert_eq!(bus.subscriber_count("offer_updated"), 0);
        assert!(cache.contains("offer:1"));

        cache.set(
            "contract:2",
            "c".to_string(),
            Some(&CacheConfig::with_ttl(Duration::from_secs(1))),
        );
        assert_eq!(cache.subscribed_tags(), vec!["contract"]);

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.subscribed_tags().is_empty());
        assert_eq!(bus.subscriber_count("contract_updated"), 0);
    }

    #[test]
    fn test_broadcasts_are_published() {
        let clock = ManualClock::new(0);
        let bus = InProcessBus::new();
        let cache = bus_manager(&clock, &bus);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(
            events::SYNC_TOPIC,
            Arc::new(move |event: &DomainEvent| {
                let message: CacheBroadcast = serde_json::from_value(event.payload.clone()).unwrap();
                sink.lock().push(message.action);
            }),
        );

        cache.set("user:1", "a".to_string(), None);
        cache.invalidate("user:1");
        cache.invalidate("user:1");
        cache.clear();

        assert_eq!(
            *seen.lock(),
            vec![CacheAction::Set, CacheAction::Invalidate, CacheAction::Clear]
        );
    }

    #[test]
    fn test_prefetch_opportunity_scan() {
        let clock = ManualClock::new(0);
        let cache = manual_manager(&clock);
        let config = CacheConfig::with_ttl(Duration::from_secs(100)).prefetch_threshold(0.5);

        cache.set("property:hot", "a".to_string(), Some(&config));
        cache.set("property:cold", "b".to_string(), Some(&config));
        for _ in 0..6 {
            cache.get("property:hot");
        }
        cache.get("property:cold");

        assert_eq!(cache.scan_prefetch_opportunities(), 0);

        clock.advance(Duration::from_secs(60));
        assert_eq!(cache.scan_prefetch_opportunities(), 1);
        assert_eq!(cache.stats().prefetch_opportunities, 1);
    }

    #[tokio::test]
    async fn test_miss_fetches_and_stores() {
        let clock = ManualClock::new(0);
        let cache = manual_manager(&clock);

        let value = cache
            .get_or_fetch("offer:1", || async { Ok("fetched".to_string()) }, None)
            .await;
        assert_eq!(value, Some("fetched".to_string()));
        assert_eq!(cache.get("offer:1"), Some("fetched".to_string()));
    }

    #[tokio::test]
    async fn test_miss_fetch_failure_returns_none() {
        let clock = ManualClock::new(0);
        let cache = manual_manager(&clock);

        let value = cache
            .get_or_fetch("offer:2", || async { Err(anyhow::anyhow!("backend down")) }, None)
            .await;
        assert_eq!(value, None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_stale_while_revalidate() {
        let clock = ManualClock::new(0);
        let cache = manual_manager(&clock);
        let config = CacheConfig::with_ttl(Duration::from_secs(10)).prefetch_threshold(0.8);

        cache.set("property:7", "old".to_string(), Some(&config));

        // Outside the window: no refresh.
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let value = cache
            .get_or_fetch(
                "property:7",
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("new".to_string())
                },
                Some(&config),
            )
            .await;
        assert_eq!(value, Some("old".to_string()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Inside the window: stale value now, fresh value afterwards.
        clock.advance(Duration::from_secs(9));
        let counter = calls.clone();
        let value = cache
            .get_or_fetch(
                "property:7",
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("new".to_string())
                },
                Some(&config),
            )
            .await;
        assert_eq!(value, Some("old".to_string()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("property:7"), Some("new".to_string()));
        assert_eq!(cache.stats().prefetches, 1);
    }

    #[tokio::test]
    async fn test_failed_prefetch_keeps_old_value() {
        let clock = ManualClock::new(0);
        let cache = manual_manager(&clock);
        let config = CacheConfig::with_ttl(Duration::from_secs(10));

        cache.set("payment:3", "old".to_string(), Some(&config));
        clock.advance(Duration::from_secs(9));

        let value = cache
            .get_or_fetch("payment:3", || async { Err(anyhow::anyhow!("timeout")) }, None)
            .await;
        assert_eq!(value, Some("old".to_string()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("payment:3"), Some("old".to_string()));
        assert_eq!(cache.stats().prefetch_failures, 1);
    }

    #[tokio::test]
    async fn test_refresh_racing_an_update_event_is_dropped() {
        let clock = ManualClock::new(0);
        let bus = InProcessBus::new();
        let cache = bus_manager(&clock, &bus);

        cache.set(
            "property:42",
            "v1".to_string(),
            Some(&CacheConfig::with_ttl(Duration::from_secs(10))),
        );
        clock.advance(Duration::from_secs(9));

        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let value = cache
            .get_or_fetch(
                "property:42",
                move || async move {
                    let _ = gate.await;
                    Ok("pre-update-read".to_string())
                },
                None,
            )
            .await;
        assert_eq!(value, Some("v1".to_string()));

        // The record changes while the refresh is still fetching.
        bus.publish(DomainEvent::new("property_updated", 0).entity("42"));
        assert!(!cache.contains("property:42"));

        release.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!cache.contains("property:42"));
        assert_eq!(cache.stats().prefetches, 0);
        assert!(cache.subscribed_tags().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_does_not_overwrite_newer_write() {
        let clock = ManualClock::new(0);
        let cache = manual_manager(&clock);

        cache.set(
            "payment:9",
            "v1".to_string(),
            Some(&CacheConfig::with_ttl(Duration::from_secs(10))),
        );
        clock.advance(Duration::from_secs(9));

        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        cache
            .get_or_fetch(
                "payment:9",
                move || async move {
                    let _ = gate.await;
                    Ok("stale".to_string())
                },
                None,
            )
            .await;

        cache.set("payment:9", "v2".to_string(), None);
        release.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.get("payment:9"), Some("v2".to_string()));
        assert_eq!(cache.stats().prefetches, 0);
    }

    #[tokio::test]
    async fn test_zero_intervals_still_sweep() {
        let cache: CacheManager<String> = CacheManager::builder()
            .sweep_interval(Duration::ZERO)
            .prefetch_scan_interval(Duration::ZERO)
            .build();
        cache.init();

        cache.set(
            "property:1",
            "a".to_string(),
            Some(&CacheConfig::with_ttl(Duration::from_millis(5))),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.is_empty());

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_init_and_shutdown_background_sweep() {
        let cache: CacheManager<String> = CacheManager::builder()
            .sweep_interval(Duration::from_millis(20))
            .prefetch_scan_interval(Duration::from_millis(20))
            .build();
        cache.init();
        cache.init();

        cache.set(
            "property:1",
            "a".to_string(),
            Some(&CacheConfig::with_ttl(Duration::from_millis(5))),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.is_empty());

        cache.shutdown().await;
    }

    #[test]
    fn test_size_estimate_falls_back_on_error() {
        let mut unserializable = HashMap::new();
        unserializable.insert((1u8, 2u8), 3u8);
        assert_eq!(estimate_size(&unserializable), DEFAULT_SIZE_ESTIMATE);

        assert_eq!(estimate_size(&"abc"), 5);
    }
}
