//! # Periodic Scheduler
//!
//! Decides when a PERIODIC object is due. An object is due on its first
//! poll, then once per period. Slots missed while the caller was busy are
//! skipped rather than replayed.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::uavobject::ObjectKey;

/// Next due time per object
#[derive(Debug, Default)]
pub struct PeriodicScheduler {
    next_due: HashMap<ObjectKey, Instant>,
}

impl PeriodicScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` should be emitted at `now` for the given period
    ///
    /// Returning `true` books the next slot.
    pub fn due(&mut self, key: ObjectKey, period: Duration, now: Instant) -> bool {
        match self.next_due.get_mut(&key) {
            None => {
                self.next_due.insert(key, now + period);
                true
            }
            Some(next) if now >= *next => {
                let following = *next + period;
                *next = if following > now { following } else { now + period };
                true
            }
            Some(_) => false,
        }
    }

    /// Stop tracking `key` (its mode or period changed)
    pub fn forget(&mut self, key: ObjectKey) {
        self.next_due.remove(&key);
    }

    /// Keep only the objects for which `keep` holds
    pub fn retain(&mut self, mut keep: impl FnMut(&ObjectKey) -> bool) {
        self.next_due.retain(|key, _| keep(key));
    }

    /// Forget every object; the next poll emits everything once
    pub fn reset(&mut self) {
        self.next_due.clear();
    }

    pub fn len(&self) -> usize {
        self.next_due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next_due.is_empty()
    }
}
