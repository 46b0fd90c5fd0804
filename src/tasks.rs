//! Periodic background task runner.
//!
//! Owns the join handles of every periodic task a component starts, and a
//! shared stop signal. `shutdown` flips the signal and waits for every task
//! to leave its loop, so no background work outlives its owner.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Shortest period a periodic task runs with.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A set of cancellable periodic tasks.
pub struct BackgroundTasks {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub fn new(name: &'static str) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            name,
            stop_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Run `tick` every `period` until shutdown.
    ///
    /// The first tick fires one full period after spawning. A zero period
    /// is raised to [`MIN_PERIOD`].
    pub fn spawn_periodic<F, Fut>(&self, task: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            warn!("{}: task '{}' has a zero period, using {:?}", self.name, task, MIN_PERIOD);
        }
        let period = period.max(MIN_PERIOD);

        let mut stop_rx = self.stop_tx.subscribe();
        let owner = self.name;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("{}: task '{}' stopped", owner, task);
        });

        self.handles.lock().push(handle);
    }

    /// Run `work` each time `trigger` is notified, until shutdown.
    ///
    /// Notifications that arrive while `work` runs coalesce into one more run.
    pub fn spawn_on_notify<F, Fut>(
        &self,
        task: &'static str,
        trigger: std::sync::Arc<tokio::sync::Notify>,
        mut work: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stop_rx = self.stop_tx.subscribe();
        let owner = self.name;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = trigger.notified() => work().await,
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("{}: task '{}' stopped", owner, task);
        });

        self.handles.lock().push(handle);
    }

    /// Number of tasks currently owned.
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every task to stop and wait for all of them.
    pub async fn shutdown(&self) {
        self.stop_tx.send_replace(true);

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("{}: background task ended abnormally: {}", self.name, e);
            }
        }

        // Allow a later init() to start fresh tasks.
        self.stop_tx.send_replace(false);
    }
}

impl std::fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("name", &self.name)
            .field("tasks", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_periodic_task_runs_and_stops() {
        let tasks = BackgroundTasks::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        tasks.spawn_periodic("tick", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(tasks.len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        tasks.shutdown().await;
        assert!(tasks.is_empty());

        let after_shutdown = ticks.load(Ordering::SeqCst);
        assert!(after_shutdown >= 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test]
    async fn test_zero_period_is_clamped() {
        let tasks = BackgroundTasks::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        tasks.spawn_periodic("tick", Duration::ZERO, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        tasks.shutdown().await;
        assert!(ticks.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_notify_task_runs_on_trigger() {
        let tasks = BackgroundTasks::new("test");
        let runs = Arc::new(AtomicUsize::new(0));
        let trigger = Arc::new(tokio::sync::Notify::new());

        let counter = runs.clone();
        tasks.spawn_on_notify("work", trigger.clone(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        trigger.notify_one();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tasks.shutdown().await;
    }
}
