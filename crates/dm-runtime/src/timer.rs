#![forbid(unsafe_code)]

//! One-shot software timers owned by a single event loop thread.
//!
//! # Design
//!
//! Armed timers live in a `BTreeMap` keyed by `(deadline, arm sequence)`, so
//! iteration order is deadline order with ties broken by arming order. A side
//! map from [`TimerId`] to its key makes stop and restart O(log n).
//!
//! [`TimerManager::process`] collects every expired id before returning, so
//! a handler that arms timers while handling an expiry never sees them fire
//! in the same pass.
//!
//! # Invariants
//!
//! 1. A timer is armed at most once; restarting replaces its deadline.
//! 2. A stopped timer never fires.
//! 3. Expired timers are disarmed before they are reported.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Wait used when `now + duration` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

fn deadline(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Handle of a timer within its [`TimerManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Default)]
pub struct TimerManager {
    next_id: u64,
    next_seq: u64,
    armed: BTreeMap<(Instant, u64), TimerId>,
    keys: HashMap<TimerId, (Instant, u64)>,
}

impl TimerManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a new timer expiring `duration` from now.
    pub fn start(&mut self, duration: Duration) -> TimerId {
        self.start_at(Instant::now(), duration)
    }

    /// Arm a new timer expiring `duration` after `now`.
    pub fn start_at(&mut self, now: Instant, duration: Duration) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.arm(id, deadline(now, duration));
        id
    }

    /// Re-arm `id` to expire `duration` from now, whether or not it is armed.
    pub fn restart(&mut self, id: TimerId, duration: Duration) {
        self.restart_at(id, Instant::now(), duration);
    }

    /// Re-arm `id` to expire `duration` after `now`.
    pub fn restart_at(&mut self, id: TimerId, now: Instant, duration: Duration) {
        self.stop(id);
        self.arm(id, deadline(now, duration));
    }

    /// Disarm `id`. Returns whether it was armed.
    pub fn stop(&mut self, id: TimerId) -> bool {
        match self.keys.remove(&id) {
            Some(key) => {
                self.armed.remove(&key);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.keys.contains_key(&id)
    }

    /// Number of armed timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Earliest armed deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Disarm and return every timer whose deadline is at or before `now`.
    pub fn process(&mut self, now: Instant) -> Vec<TimerId> {
        let mut expired = Vec::new();
        while let Some(entry) = self.armed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let id = entry.remove();
            self.keys.remove(&id);
            expired.push(id);
        }
        expired
    }

    fn arm(&mut self, id: TimerId, deadline: Instant) {
        let key = (deadline, self.next_seq);
        self.next_seq += 1;
        self.armed.insert(key, id);
        self.keys.insert(id, key);
    }
}
