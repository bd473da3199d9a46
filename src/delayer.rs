//! Delayed and periodic action scheduler.
//!
//! A [`Delayer`] owns a set of registered actions and a background tokio task
//! that wakes every tick and runs whichever actions are due. One-shot actions
//! are removed after they run; periodic actions are rescheduled.
//!
//! Each delayer is an independent object; nothing here is global.

use crate::error::{NetError, NetResult};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use slab::Slab;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Default interval between checks for due actions.
pub const DEFAULT_TICK: Duration = Duration::from_millis(1);

type Action = Arc<Mutex<Box<dyn FnMut() + Send>>>;

/// Handle to a registered action.
///
/// Slots are reused once an action is gone; the generation keeps a stale
/// handle from matching the action that took its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionId {
    key: usize,
    generation: u64,
}

struct Entry {
    generation: u64,
    due: Instant,
    period: Option<Duration>,
    action: Action,
}

struct Inner {
    actions: Mutex<Slab<Entry>>,
    next_generation: AtomicU64,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    tick: Duration,
}

/// Scheduler for delayed and repeating actions.
#[derive(Clone)]
pub struct Delayer {
    inner: Arc<Inner>,
}

impl Default for Delayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Delayer {
    pub fn new() -> Self {
        Self::with_tick(DEFAULT_TICK)
    }

    /// Create a delayer that checks for due actions every `tick`.
    pub fn with_tick(tick: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                actions: Mutex::new(Slab::new()),
                next_generation: AtomicU64::new(0),
                running: AtomicBool::new(false),
                task: Mutex::new(None),
                tick: tick.max(Duration::from_micros(100)),
            }),
        }
    }

    /// Run `action` once, on the next tick.
    pub fn register<F>(&self, action: F) -> ActionId
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(Instant::now(), None, action)
    }

    /// Run `action` once, after `delay`.
    pub fn register_after<F>(&self, delay: Duration, action: F) -> NetResult<ActionId>
    where
        F: FnMut() + Send + 'static,
    {
        Ok(self.insert(deadline(delay)?, None, action))
    }

    /// Run `action` once, at `when`. A time in the past runs on the next tick.
    pub fn register_at<F>(&self, when: DateTime<Local>, action: F) -> NetResult<ActionId>
    where
        F: FnMut() + Send + 'static,
    {
        Ok(self.insert(deadline(until(when))?, None, action))
    }

    /// Run `action` at `first`, then every `period` after each run.
    pub fn register_every<F>(
        &self,
        first: DateTime<Local>,
        period: Duration,
        action: F,
    ) -> NetResult<ActionId>
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            return Err(NetError::config("repeat period must be greater than 0"));
        }
        Ok(self.insert(deadline(until(first))?, Some(period), action))
    }

    /// Remove an action. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ActionId) -> bool {
        let mut actions = self.inner.actions.lock();
        match actions.get(id.key) {
            Some(entry) if entry.generation == id.generation => {
                actions.remove(id.key);
                true
            }
            _ => false,
        }
    }

    /// Number of registered actions.
    pub fn action_count(&self) -> usize {
        self.inner.actions.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Start the background task. Does nothing if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> NetResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| NetError::State("delayer must be started inside a tokio runtime"))?;

        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval(inner.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                inner.run_due();
            }
        });
        *self.inner.task.lock() = Some(handle);
        debug!(tick_us = self.inner.tick.as_micros() as u64, "Delayer started");
        Ok(())
    }

    /// Stop the background task and drop every registered action.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        self.inner.actions.lock().clear();
        debug!("Delayer stopped");
    }

    fn insert<F>(&self, due: Instant, period: Option<Duration>, action: F) -> ActionId
    where
        F: FnMut() + Send + 'static,
    {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            generation,
            due,
            period,
            action: Arc::new(Mutex::new(Box::new(action))),
        };
        let key = self.inner.actions.lock().insert(entry);
        ActionId { key, generation }
    }
}

impl Inner {
    /// Run every action that is due. Returns how many ran.
    fn run_due(&self) -> usize {
        let now = Instant::now();

        // Collect under the lock, run without it so actions may register or
        // unregister other actions.
        let ready: Vec<(usize, Action)> = {
            let mut actions = self.actions.lock();
            let due: Vec<usize> = actions
                .iter()
                .filter(|(_, entry)| entry.due <= now)
                .map(|(key, _)| key)
                .collect();

            due.into_iter()
                .filter_map(|key| {
                    let entry = actions.get_mut(key)?;
                    let action = Arc::clone(&entry.action);
                    match entry.period {
                        Some(period) => entry.due = now + period,
                        None => {
                            actions.remove(key);
                        }
                    }
                    Some((key, action))
                })
                .collect()
        };

        for (key, action) in &ready {
            let mut action = action.lock();
            if panic::catch_unwind(AssertUnwindSafe(|| (*action)())).is_err() {
                warn!(action_id = *key, "Delayed action panicked");
            }
        }
        ready.len()
    }
}

fn until(when: DateTime<Local>) -> Duration {
    (when - Local::now()).to_std().unwrap_or(Duration::ZERO)
}

fn deadline(delay: Duration) -> NetResult<Instant> {
    Instant::now()
        .checked_add(delay)
        .ok_or_else(|| NetError::config(format!("delay of {delay:?} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_one_shot_runs_once() {
        let delayer = Delayer::with_tick(Duration::from_millis(2));
        let (count, action) = counter();
        delayer.register(action);
        assert_eq!(delayer.action_count(), 1);
        assert!(!delayer.is_running());

        delayer.start().unwrap();
        assert!(delayer.is_running());
        wait_for(|| count.load(Ordering::SeqCst) == 1).await;
        assert_eq!(delayer.action_count(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        delayer.stop();
    }

    #[tokio::test]
    async fn test_register_after_waits() {
        let delayer = Delayer::with_tick(Duration::from_millis(2));
        delayer.start().unwrap();

        let (count, action) = counter();
        delayer
            .register_after(Duration::from_millis(60), action)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        wait_for(|| count.load(Ordering::SeqCst) == 1).await;
        delayer.stop();
    }

    #[tokio::test]
    async fn test_register_at_in_the_past_runs_immediately() {
        let delayer = Delayer::with_tick(Duration::from_millis(2));
        let (count, action) = counter();
        delayer
            .register_at(Local::now() - chrono::Duration::seconds(5), action)
            .unwrap();
        delayer.start().unwrap();
        wait_for(|| count.load(Ordering::SeqCst) == 1).await;
        delayer.stop();
    }

    #[tokio::test]
    async fn test_periodic_until_unregistered() {
        let delayer = Delayer::with_tick(Duration::from_millis(1));
        let (count, action) = counter();
        let id = delayer
            .register_every(Local::now(), Duration::from_millis(5), action)
            .unwrap();
        delayer.start().unwrap();

        wait_for(|| count.load(Ordering::SeqCst) >= 3).await;
        assert_eq!(delayer.action_count(), 1);

        assert!(delayer.unregister(id));
        assert!(!delayer.unregister(id));
        let seen = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
        delayer.stop();
    }

    #[tokio::test]
    async fn test_stop_clears_actions() {
        let delayer = Delayer::new();
        delayer.start().unwrap();
        // Starting twice is a no-op.
        delayer.start().unwrap();

        let (count, action) = counter();
        delayer
            .register_after(Duration::from_secs(60), action)
            .unwrap();
        assert_eq!(delayer.action_count(), 1);

        delayer.stop();
        assert!(!delayer.is_running());
        assert_eq!(delayer.action_count(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stale_id_does_not_remove_reused_slot() {
        let delayer = Delayer::new();
        let old = delayer.register(|| {});
        assert!(delayer.unregister(old));

        // The freed slot is handed to the next action.
        let new = delayer.register(|| {});
        assert_ne!(old, new);
        assert!(!delayer.unregister(old));
        assert_eq!(delayer.action_count(), 1);

        assert!(delayer.unregister(new));
        assert_eq!(delayer.action_count(), 0);
    }

    #[test]
    fn test_invalid_registrations() {
        let delayer = Delayer::new();
        let err = delayer
            .register_every(Local::now(), Duration::ZERO, || {})
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);

        // No runtime to start on.
        assert!(delayer.start().is_err());
        assert!(!delayer.is_running());
    }

    #[tokio::test]
    async fn test_panicking_action_does_not_stop_delayer() {
        let delayer = Delayer::with_tick(Duration::from_millis(2));
        delayer.register(|| panic!("bad action"));
        let (count, action) = counter();
        delayer
            .register_after(Duration::from_millis(10), action)
            .unwrap();

        delayer.start().unwrap();
        wait_for(|| count.load(Ordering::SeqCst) == 1).await;
        delayer.stop();
    }
}
