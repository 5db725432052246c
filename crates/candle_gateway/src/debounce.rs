//! Keyed coalescing timers.
//!
//! Each key has at most one pending timer. In [`CoalesceMode::Debounce`] every
//! `schedule` call restarts the window, so a key that keeps receiving calls
//! faster than the window never fires until the calls stop. In
//! [`CoalesceMode::Throttle`] the first call arms the timer and later calls
//! only replace the producer, giving at most one firing per window.
//!
//! Either way only the most recent producer runs; superseded ones are dropped.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// Window used when none is configured.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(100);

type Producer = Box<dyn FnOnce() + Send + Sync + 'static>;

/// How repeated calls for the same key interact with the pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoalesceMode {
    /// Trailing-edge debounce: each call restarts the window.
    #[default]
    Debounce,
    /// Trailing-edge throttle: the window starts at the first call.
    Throttle,
}

impl FromStr for CoalesceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debounce" => Ok(CoalesceMode::Debounce),
            "throttle" => Ok(CoalesceMode::Throttle),
            other => Err(format!("unknown coalesce mode: {other}")),
        }
    }
}

impl fmt::Display for CoalesceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoalesceMode::Debounce => f.write_str("debounce"),
            CoalesceMode::Throttle => f.write_str("throttle"),
        }
    }
}

struct PendingTimer {
    generation: u64,
    producer: Option<Producer>,
    task: JoinHandle<()>,
}

/// Keyed timer facility.
///
/// Producers run on the timer task while the key's map entry is held, so a
/// concurrent [`cancel`](Debouncer::cancel) either removes the timer before it
/// fires or returns after the producer has finished. Producers must not call
/// back into the same `Debouncer`.
pub struct Debouncer<K> {
    timers: Arc<DashMap<K, PendingTimer>>,
    mode: CoalesceMode,
    next_generation: AtomicU64,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
{
    pub fn new(mode: CoalesceMode) -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
            mode,
            next_generation: AtomicU64::new(0),
        }
    }

    /// Arrange for `producer` to run `window` after this call (debounce) or
    /// after the first pending call (throttle), replacing any producer
    /// already pending for `key`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, key: K, producer: F, window: Duration)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.schedule_inner(key, None, Box::new(producer), window);
    }

    /// Like [`schedule`](Self::schedule), but a no-op once `live` is cleared.
    ///
    /// `live` is read while the key's entry is held. A caller that clears the
    /// flag and then calls [`cancel`](Self::cancel) therefore never leaves a
    /// timer behind, even if this call races with it from another thread, and
    /// a stale call cannot overwrite a producer scheduled by a newer owner of
    /// the same key. Returns whether a producer was scheduled.
    pub fn schedule_while<F>(
        &self,
        key: K,
        live: &AtomicBool,
        producer: F,
        window: Duration,
    ) -> bool
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.schedule_inner(key, Some(live), Box::new(producer), window)
    }

    fn schedule_inner(
        &self,
        key: K,
        live: Option<&AtomicBool>,
        producer: Producer,
        window: Duration,
    ) -> bool {
        let entry = self.timers.entry(key.clone());
        if live.is_some_and(|live| !live.load(Ordering::Acquire)) {
            trace!("Skipping schedule for released key {}", entry.key());
            return false;
        }

        match entry {
            Entry::Occupied(mut entry) => {
                counter!("gateway_updates_superseded_total").increment(1);
                let pending = entry.get_mut();
                pending.producer = Some(producer);

                if self.mode == CoalesceMode::Debounce {
                    pending.task.abort();
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    pending.generation = generation;
                    pending.task = self.arm(key, generation, window);
                    trace!("Debounce timer for {} restarted", entry.key());
                }
            }
            Entry::Vacant(entry) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let task = self.arm(key, generation, window);
                trace!("Debounce timer for {} armed", entry.key());
                entry.insert(PendingTimer {
                    generation,
                    producer: Some(producer),
                    task,
                });
            }
        }
        true
    }

    /// Discard the pending timer for `key` without running it.
    ///
    /// Returns whether a timer was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match self.timers.remove(key) {
            Some((_, pending)) => {
                pending.task.abort();
                trace!("Debounce timer for {} cancelled", key);
                true
            }
            None => false,
        }
    }

    /// Discard every pending timer.
    pub fn cancel_all(&self) -> usize {
        let keys: Vec<K> = self.timers.iter().map(|e| e.key().clone()).collect();
        keys.iter().filter(|key| self.cancel(key)).count()
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    /// Number of keys with a pending timer.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    fn arm(&self, key: K, generation: u64, window: Duration) -> JoinHandle<()> {
        let timers = Arc::clone(&self.timers);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            fire(&timers, key, generation);
        })
    }
}

fn fire<K: Eq + Hash>(timers: &DashMap<K, PendingTimer>, key: K, generation: u64) {
    if let Entry::Occupied(mut entry) = timers.entry(key) {
        // A newer schedule replaced this timer after it woke up.
        if entry.get().generation != generation {
            return;
        }
        if let Some(producer) = entry.get_mut().producer.take() {
            producer();
        }
        entry.remove();
    }
}

impl<K> Default for Debouncer<K>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CoalesceMode::default())
    }
}
