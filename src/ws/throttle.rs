//! Per-subscription delivery throttling.
//!
//! A throttled subscription buffers every accepted delivery. The first
//! delivery into an empty buffer arms a flush timer one interval ahead; when
//! it fires, the whole buffer is handed back in arrival order and the
//! subscription starts over. Deliveries are never merged or dropped.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::{Delivery, SubscriptionId};
use crate::scheduler::TimerSet;

/// Buffers deliveries per subscription and releases them in batches.
#[derive(Debug, Default)]
pub struct Throttler {
    buffers: HashMap<SubscriptionId, Vec<Delivery>>,
    timers: TimerSet<SubscriptionId>,
}

impl Throttler {
    /// Creates an empty throttler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `delivery`. Arms a flush at `now + interval` if the buffer was
    /// empty.
    pub fn offer(&mut self, delivery: Delivery, interval: Duration, now: Instant) {
        let id = delivery.subscription_id;
        let buffer = self.buffers.entry(id).or_default();
        if buffer.is_empty() {
            self.timers.schedule(id, now + interval);
        }
        buffer.push(delivery);
    }

    /// Returns the earliest pending flush.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Takes every buffer whose flush is due at `now`, earliest flush first.
    pub fn due(&mut self, now: Instant) -> Vec<Delivery> {
        self.timers
            .pop_due(now)
            .into_iter()
            .filter_map(|id| self.buffers.remove(&id))
            .flatten()
            .collect()
    }

    /// Drops the buffer of `id` and its flush timer. Returns how many
    /// deliveries were discarded.
    pub fn discard(&mut self, id: &SubscriptionId) -> usize {
        self.timers.cancel(id);
        self.buffers.remove(id).map_or(0, |b| b.len())
    }

    /// Returns the number of buffered deliveries for `id`.
    #[cfg(test)]
    pub(crate) fn pending(&self, id: &SubscriptionId) -> usize {
        self.buffers.get(id).map_or(0, Vec::len)
    }
}
