//! Fixed-window rate limiter with global abuse blocks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::abuse::{AbuseDetector, AbusePattern, AbuseResponse, SecurityAction, SecurityEvent, event_context};
use super::entry::{BlockInfo, DenyReason, RateLimitEntry, RateLimitResult, RequestRecord, ceil_secs};
use super::history::{DEFAULT_HISTORY_CAPACITY, RequestHistory};
use super::policy::{RateLimitCategory, RateLimitPolicy};
use crate::clock::{SharedClock, SystemClock, duration_ms};
use crate::database::SnapshotStore;
use crate::error::{GuardError, GuardResult};
use crate::tasks::BackgroundTasks;

/// Endpoint key whose block applies to every endpoint.
pub const GLOBAL_ENDPOINT: &str = "all";

/// How often idle entries are dropped once the limiter is started.
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

const RATE_LIMITS_KEY: &str = "rate_limits";
const HISTORY_KEY: &str = "request_history";

struct Inner {
    entries: DashMap<String, RateLimitEntry>,
    policies: HashMap<RateLimitCategory, RateLimitPolicy>,
    history: RequestHistory,
    detector: AbuseDetector,
    clock: SharedClock,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    dirty: Arc<Notify>,
    tasks: BackgroundTasks,
    prune_interval: Duration,
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    policies: HashMap<RateLimitCategory, RateLimitPolicy>,
    history_capacity: usize,
    clock: SharedClock,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    prune_interval: Duration,
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self {
            policies: RateLimitCategory::ALL
                .into_iter()
                .map(|category| (category, category.policy()))
                .collect(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            clock: Arc::new(SystemClock),
            snapshots: None,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
        }
    }
}

impl RateLimiterBuilder {
    /// Override the policy of one category.
    #[must_use]
    pub fn policy(mut self, category: RateLimitCategory, policy: RateLimitPolicy) -> Self {
        self.policies.insert(category, policy);
        self
    }

    #[must_use]
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    /// Persist entries and history to this store.
    #[must_use]
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn build(self) -> RateLimiter {
        RateLimiter {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                policies: self.policies,
                history: RequestHistory::new(self.history_capacity),
                detector: AbuseDetector::new(),
                clock: self.clock,
                snapshots: self.snapshots,
                dirty: Arc::new(Notify::new()),
                tasks: BackgroundTasks::new("rate_limiter"),
                prune_interval: self.prune_interval,
            }),
        }
    }
}

/// Per-endpoint admission control.
///
/// Each endpoint gets a lazily created entry holding its window counter and
/// block state. The check-increment-block sequence for one endpoint runs
/// under that entry's map lock, so concurrent callers never overshoot a
/// limit. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// Limiter with built-in policies and no persistence.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start the idle entry pruner and, with a snapshot store, the
    /// background snapshot writer.
    ///
    /// Calling `init` on a running limiter does nothing.
    pub fn init(&self) {
        if !self.inner.tasks.is_empty() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .tasks
            .spawn_periodic("entry_pruner", self.inner.prune_interval, move || {
                let limiter = weak.upgrade().map(|inner| RateLimiter { inner });
                async move {
                    if let Some(limiter) = limiter {
                        limiter.prune_idle();
                    }
                }
            });

        if self.inner.snapshots.is_none() {
            info!("Rate limiter started (prune every {:?})", self.inner.prune_interval);
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .tasks
            .spawn_on_notify("snapshot_writer", Arc::clone(&self.inner.dirty), move || {
                let limiter = weak.upgrade().map(|inner| RateLimiter { inner });
                async move {
                    if let Some(limiter) = limiter {
                        limiter.persist_logged().await;
                    }
                }
            });

        info!(
            "Rate limiter started with snapshot persistence (prune every {:?})",
            self.inner.prune_interval
        );
    }

    /// Stop the snapshot writer and flush state one last time.
    pub async fn shutdown(&self) {
        self.inner.tasks.shutdown().await;

        if self.inner.snapshots.is_some() {
            self.persist_logged().await;
        }

        info!("Rate limiter stopped");
    }

    /// Current time on the limiter's clock, in epoch ms.
    pub fn now_ms(&self) -> i64 {
        self.inner.clock.now_ms()
    }

    /// Policy in force for a category.
    pub fn policy(&self, category: RateLimitCategory) -> RateLimitPolicy {
        self.inner
            .policies
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.policy())
    }

    /// Admit or deny one request to `endpoint`.
    ///
    /// A blocked global entry denies everything. Otherwise the endpoint's
    /// window counter is advanced, and crossing the category limit blocks
    /// the endpoint for the category's block duration.
    pub fn check_rate_limit(&self, endpoint: &str, category: impl Into<RateLimitCategory>) -> RateLimitResult {
        let category = category.into();
        let policy = self.policy(category);
        let now = self.now_ms();

        if endpoint != GLOBAL_ENDPOINT {
            if let Some(until) = self.global_block_until(now) {
                debug!(endpoint, "Request denied by global block");
                return RateLimitResult::deny(DenyReason::Blocked, until - now);
            }
        }

        let window_ms = duration_ms(policy.window);
        let result = {
            let mut entry = self
                .inner
                .entries
                .entry(endpoint.to_string())
                .or_insert_with(|| RateLimitEntry::new(endpoint, now, window_ms));

            if entry.blocked {
                if now < entry.blocked_until {
                    return RateLimitResult::deny(DenyReason::Blocked, entry.blocked_until - now);
                }
                entry.unblock();
                entry.start_window(now, window_ms);
            } else if now > entry.reset_at {
                entry.start_window(now, window_ms);
            }

            entry.count += 1;

            if entry.count > policy.max_requests {
                let block_ms = duration_ms(policy.block_duration);
                entry.block(now.saturating_add(block_ms), Some(DenyReason::RateLimitExceeded.as_str().to_string()));
                warn!(
                    endpoint,
                    %category,
                    count = entry.count,
                    "Rate limit exceeded, blocking for {:?}",
                    policy.block_duration
                );
                RateLimitResult::deny(DenyReason::RateLimitExceeded, block_ms)
            } else {
                RateLimitResult::allow()
            }
        };

        self.schedule_persist();
        result
    }

    /// Block `endpoint` for `duration` regardless of its counter.
    pub fn block(&self, endpoint: &str, duration: Duration, reason: Option<&str>) {
        let until = self.now_ms().saturating_add(duration_ms(duration));
        self.block_until(endpoint, until, reason, false);

        warn!(
            "Blocked endpoint {} for {:?}: {}",
            endpoint,
            duration,
            reason.unwrap_or("manual block")
        );
    }

    /// Set a block ending at `until`. With `extend_only`, a block already
    /// lasting at least that long is left alone and `false` is returned.
    fn block_until(&self, endpoint: &str, until: i64, reason: Option<&str>, extend_only: bool) -> bool {
        let now = self.now_ms();
        let window_ms = duration_ms(self.policy(RateLimitCategory::Default).window);

        {
            let mut entry = self
                .inner
                .entries
                .entry(endpoint.to_string())
                .or_insert_with(|| RateLimitEntry::new(endpoint, now, window_ms));

            if extend_only && entry.is_blocked_at(now) && entry.blocked_until >= until {
                return false;
            }
            entry.block(until, reason.map(str::to_string));
        }

        self.schedule_persist();
        true
    }

    /// Whether `endpoint` is blocked right now, by its own entry or globally.
    pub fn is_blocked(&self, endpoint: &str) -> bool {
        self.get_block_info(endpoint).is_some()
    }

    /// Details of the longest block currently affecting `endpoint`.
    pub fn get_block_info(&self, endpoint: &str) -> Option<BlockInfo> {
        let now = self.now_ms();

        [endpoint, GLOBAL_ENDPOINT]
            .into_iter()
            .filter_map(|key| {
                let entry = self.inner.entries.get(key)?;
                entry.is_blocked_at(now).then(|| BlockInfo {
                    endpoint: key.to_string(),
                    blocked_until: entry.blocked_until,
                    retry_after: ceil_secs(entry.blocked_until - now),
                    reason: entry.block_reason.clone(),
                })
            })
            .max_by_key(|info| info.blocked_until)
    }

    fn global_block_until(&self, now: i64) -> Option<i64> {
        self.inner
            .entries
            .get(GLOBAL_ENDPOINT)
            .filter(|entry| entry.is_blocked_at(now))
            .map(|entry| entry.blocked_until)
    }

    /// Copy of one endpoint's entry.
    pub fn entry(&self, endpoint: &str) -> Option<RateLimitEntry> {
        self.inner.entries.get(endpoint).map(|entry| entry.value().clone())
    }

    /// Number of tracked endpoints.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Drop entries that are neither blocked nor inside their window. Such an
    /// entry admits its next request exactly like a fresh one. Returns the
    /// number dropped.
    pub fn prune_idle(&self) -> usize {
        let now = self.now_ms();
        let before = self.inner.entries.len();
        self.inner
            .entries
            .retain(|_, entry| entry.is_blocked_at(now) || now <= entry.reset_at);

        let pruned = before.saturating_sub(self.inner.entries.len());
        if pruned > 0 {
            debug!("Pruned {} idle rate limit entries", pruned);
            self.schedule_persist();
        }
        pruned
    }

    /// Drop every entry and the request history.
    pub fn reset(&self) {
        self.inner.entries.clear();
        self.inner.history.clear();
        self.schedule_persist();

        info!("Rate limiter state reset");
    }

    /// Append a completed request to the history and react to any abuse
    /// pattern it completes.
    pub fn track_request(&self, record: RequestRecord) {
        let now = self.now_ms();
        let detector = &self.inner.detector;

        let (matched, recent) = self.inner.history.push_and_inspect(record, |records| {
            let matched = detector.evaluate(records, now);
            let recent = if matched.is_empty() {
                Vec::new()
            } else {
                event_context(records)
            };
            (matched, recent)
        });

        for pattern in matched {
            self.respond(pattern, now, recent.clone());
        }

        self.schedule_persist();
    }

    fn respond(&self, pattern: AbusePattern, now: i64, recent: Vec<RequestRecord>) {
        let action = match pattern.response() {
            AbuseResponse::Flag => {
                warn!(pattern = pattern.as_str(), "Suspicious activity flagged");
                SecurityAction::Flag
            }
            AbuseResponse::Block(duration) => {
                let until = now.saturating_add(duration_ms(duration));
                if !self.block_until(GLOBAL_ENDPOINT, until, Some(pattern.as_str()), true) {
                    return;
                }
                warn!(
                    pattern = pattern.as_str(),
                    "Abuse detected, blocking all endpoints for {:?}", duration
                );
                SecurityAction::Block
            }
        };

        self.inner.detector.record(SecurityEvent {
            pattern,
            action,
            timestamp: now,
            recent,
        });
    }

    /// Security events, oldest first.
    pub fn security_events(&self) -> Vec<SecurityEvent> {
        self.inner.detector.events()
    }

    /// Copy of the request history, oldest first.
    pub fn history(&self) -> Vec<RequestRecord> {
        self.inner.history.snapshot()
    }

    fn schedule_persist(&self) {
        if self.inner.snapshots.is_some() {
            self.inner.dirty.notify_one();
        }
    }

    /// Load entries and history from the snapshot store.
    ///
    /// Missing snapshots leave state untouched. Unreadable or corrupt ones
    /// are logged and leave that part of the state empty.
    pub async fn restore(&self) {
        let Some(store) = &self.inner.snapshots else {
            return;
        };

        match load_snapshot::<Vec<RateLimitEntry>>(store.as_ref(), RATE_LIMITS_KEY).await {
            Ok(Some(entries)) => {
                self.inner.entries.clear();
                for entry in entries {
                    self.inner.entries.insert(entry.endpoint.clone(), entry);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Discarding rate limit snapshot: {}", e);
                self.inner.entries.clear();
            }
        }

        match load_snapshot::<Vec<RequestRecord>>(store.as_ref(), HISTORY_KEY).await {
            Ok(Some(records)) => self.inner.history.restore(records),
            Ok(None) => {}
            Err(e) => {
                warn!("Discarding request history snapshot: {}", e);
                self.inner.history.clear();
            }
        }

        info!(
            "Restored {} rate limit entries and {} history records",
            self.inner.entries.len(),
            self.inner.history.len()
        );
    }

    /// Write entries and history to the snapshot store now.
    pub async fn persist_now(&self) -> GuardResult<()> {
        let Some(store) = &self.inner.snapshots else {
            return Ok(());
        };

        let entries: Vec<RateLimitEntry> = self.inner.entries.iter().map(|entry| entry.value().clone()).collect();
        let entries = serde_json::to_string(&entries)?;
        let history = serde_json::to_string(&self.inner.history.snapshot())?;

        store
            .save(RATE_LIMITS_KEY, entries)
            .await
            .map_err(|e| GuardError::Backend(format!("{e:#}")))?;
        store
            .save(HISTORY_KEY, history)
            .await
            .map_err(|e| GuardError::Backend(format!("{e:#}")))?;

        debug!("Rate limiter snapshot written");
        Ok(())
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist_now().await {
            warn!("Failed to persist rate limiter snapshot: {}", e);
        }
    }
}

async fn load_snapshot<T>(store: &dyn SnapshotStore, key: &str) -> GuardResult<Option<T>>
where
    T: serde::de::DeserializeOwned,
{
    let blob = store
        .load(key)
        .await
        .map_err(|e| GuardError::Backend(format!("{e:#}")))?;

    match blob {
        Some(blob) => Ok(Some(serde_json::from_str(&blob)?)),
        None => Ok(None),
    }
}
