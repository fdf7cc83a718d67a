//! Timer abstraction.
//!
//! Connections never call `tokio::time` directly. They ask an injected
//! [`Scheduler`] for the current instant and for a sleep future, and keep
//! their pending timers (reconnect, heart-beats, throttle flushes) in a
//! [`TimerSet`]. Cancelling a timer is removing its key from the set, so a
//! disposed connection cannot be woken by a stale reconnect.
//!
//! Tests drive the default [`TokioScheduler`] with tokio's paused clock
//! (`#[tokio::test(start_paused = true)]`), which makes every deadline
//! deterministic.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;

use futures_util::future::BoxFuture;
use tokio::time::Instant;

/// Source of time and sleeping for connection tasks.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Returns the current instant.
    fn now(&self) -> Instant;

    /// Returns a future that completes at `deadline`.
    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()>;
}

/// [`Scheduler`] backed by the tokio timer wheel.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep_until(deadline))
    }
}

/// Sleeps until `deadline`, or forever when there is none.
pub(crate) fn sleep_until_opt(
    scheduler: &dyn Scheduler,
    deadline: Option<Instant>,
) -> BoxFuture<'static, ()> {
    match deadline {
        Some(at) => scheduler.sleep_until(at),
        None => Box::pin(std::future::pending()),
    }
}

/// Set of one-shot timers identified by key.
///
/// Scheduling a key that is already armed replaces its deadline. Timers with
/// the same deadline fire in the order they were scheduled.
#[derive(Debug)]
pub struct TimerSet<K> {
    queue: BTreeMap<(Instant, u64), K>,
    armed: HashMap<K, (Instant, u64)>,
    seq: u64,
}

impl<K: Clone + Eq + Hash> TimerSet<K> {
    /// Creates an empty timer set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            armed: HashMap::new(),
            seq: 0,
        }
    }

    /// Arms `key` to fire at `deadline`, replacing any earlier arming.
    pub fn schedule(&mut self, key: K, deadline: Instant) {
        self.cancel(&key);
        let slot = (deadline, self.seq);
        self.seq = self.seq.wrapping_add(1);
        self.queue.insert(slot, key.clone());
        self.armed.insert(key, slot);
    }

    /// Disarms `key`. Returns `true` if it was armed.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.armed.remove(key) {
            Some(slot) => {
                self.queue.remove(&slot);
                true
            }
            None => false,
        }
    }

    /// Returns `true` if `key` is armed.
    #[must_use]
    pub fn is_armed(&self, key: &K) -> bool {
        self.armed.contains_key(key)
    }

    /// Returns the deadline of `key`, if armed.
    #[cfg(test)]
    pub(crate) fn deadline(&self, key: &K) -> Option<Instant> {
        self.armed.get(key).map(|(at, _)| *at)
    }

    /// Returns the earliest armed deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    /// Removes and returns every key whose deadline is at or before `now`,
    /// earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<K> {
        let mut due = Vec::new();
        while let Some((&(at, _), _)) = self.queue.first_key_value() {
            if at > now {
                break;
            }
            if let Some((_, key)) = self.queue.pop_first() {
                self.armed.remove(&key);
                due.push(key);
            }
        }
        due
    }

    /// Disarms every timer.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.armed.clear();
    }

    /// Returns the number of armed timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    /// Returns `true` if no timer is armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

impl<K: Clone + Eq + Hash> Default for TimerSet<K> {
    fn default() -> Self {
        Self::new()
    }
}
