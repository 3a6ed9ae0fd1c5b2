#![forbid(unsafe_code)]

//! Per-thread change dispatcher.
//!
//! # Design
//!
//! A [`Dispatcher`] owns a FIFO of observers awaiting their callback. Writers
//! on any thread append to it during fan-out and raise the dispatcher's
//! [`Signal`]; the owning thread drains it with [`Dispatcher::dispatch_one`],
//! one observer per call, from its run loop.
//!
//! The queue mutex is the only lock a writer shares with the dispatching
//! thread, and it is held only for push, pop, and remove.
//!
//! # Invariants
//!
//! 1. An observer appears in at most one live queue entry. Entries left
//!    behind by a restart carry an outdated ticket and are skipped.
//! 2. Callbacks run only inside `dispatch_one`, i.e. only on the thread that
//!    drains the dispatcher.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug_span;

use crate::observer::{ObserverShared, ObserverState};

/// Error creating an observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// The dispatcher already serves `max_observers` observers.
    Capacity { dispatcher: String, max: usize },
}

impl fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capacity { dispatcher, max } => {
                write!(f, "dispatcher {dispatcher:?} is at its observer limit ({max})")
            }
        }
    }
}

impl std::error::Error for SubscribeError {}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name used in logs and spans.
    pub name: String,
    /// Maximum live observers; `None` for unbounded.
    pub max_observers: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "dispatcher".to_string(),
            max_observers: None,
        }
    }
}

impl DispatcherConfig {
    /// Set the dispatcher name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Limit the number of live observers.
    #[must_use]
    pub fn with_max_observers(mut self, max: usize) -> Self {
        self.max_observers = Some(max);
        self
    }
}

/// Auto-reset wake-up flag shared by a run loop and everything that feeds it.
#[derive(Debug, Default)]
pub struct Signal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    /// Create a lowered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake the waiter.
    pub fn raise(&self) {
        let mut raised = self.raised.lock().expect("signal lock poisoned");
        *raised = true;
        self.cond.notify_all();
    }

    /// Block until raised or `timeout` elapses. Lowers the signal and returns
    /// whether it had been raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.raised.lock().expect("signal lock poisoned");
        let (mut raised, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |raised| !*raised)
            .expect("signal lock poisoned");
        std::mem::replace(&mut *raised, false)
    }
}

struct Pending {
    observer: Arc<ObserverShared>,
    ticket: u64,
}

struct DispatcherInner {
    config: DispatcherConfig,
    queue: Mutex<VecDeque<Pending>>,
    signal: Arc<Signal>,
    observers: AtomicUsize,
}

/// Queue of observers awaiting their callback on one thread.
///
/// Cloning shares the same dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.config.name)
            .field("pending", &self.pending_len())
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher with its own signal.
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        Self::with_signal(config, Arc::new(Signal::new()))
    }

    /// Create a dispatcher that raises an existing `signal` on enqueue, so a
    /// run loop can wait on one signal for all of its wake-up sources.
    #[must_use]
    pub fn with_signal(config: DispatcherConfig, signal: Arc<Signal>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                queue: Mutex::new(VecDeque::new()),
                signal,
                observers: AtomicUsize::new(0),
            }),
        }
    }

    /// Dispatcher name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Signal raised on every enqueue.
    #[must_use]
    pub fn signal(&self) -> &Arc<Signal> {
        &self.inner.signal
    }

    /// Number of queued notifications.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.queue().len()
    }

    /// True when at least one notification is queued.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending_len() > 0
    }

    /// Number of live observers created on this dispatcher.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner.observers.load(Ordering::Acquire)
    }

    /// True when both handles share the same dispatcher.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.inner.queue.lock().expect("dispatcher queue lock poisoned")
    }

    pub(crate) fn reserve_observer(&self) -> Result<(), SubscribeError> {
        let max = self.inner.config.max_observers;
        self.inner
            .observers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match max {
                Some(max) if n >= max => None,
                _ => Some(n + 1),
            })
            .map(|_| ())
            .map_err(|_| SubscribeError::Capacity {
                dispatcher: self.inner.config.name.clone(),
                max: max.unwrap_or(usize::MAX),
            })
    }

    pub(crate) fn release_observer(&self) {
        self.inner.observers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Append `observer`. Caller holds the observer's state lock.
    pub(crate) fn enqueue(&self, observer: &Arc<ObserverShared>, state: &mut ObserverState) {
        state.ticket = state.ticket.wrapping_add(1);
        self.queue().push_back(Pending {
            observer: Arc::clone(observer),
            ticket: state.ticket,
        });
        self.inner.signal.raise();
    }

    /// Drop any queued entry for `observer`.
    pub(crate) fn remove(&self, observer: &Arc<ObserverShared>) {
        self.queue().retain(|p| !Arc::ptr_eq(&p.observer, observer));
    }

    /// Drop every queued notification without running it. Returns how many
    /// were dropped.
    ///
    /// A stopped loop calls this so queued records, which hold the
    /// dispatcher, do not keep it alive.
    pub fn discard_pending(&self) -> usize {
        let dropped = std::mem::take(&mut *self.queue());
        dropped.len()
    }

    /// Deliver at most one queued notification on the calling thread.
    ///
    /// Returns `true` if an entry was taken off the queue (whether or not
    /// its callback ran), `false` if the queue was empty.
    pub fn dispatch_one(&self) -> bool {
        let Some(entry) = self.queue().pop_front() else {
            return false;
        };
        if let Some((registry, point, name)) = entry.observer.begin_notify(entry.ticket) {
            let span = debug_span!("dm.dispatch", dispatcher = %self.name(), point = %name);
            let _guard = span.enter();
            entry.observer.invoke(&registry, point);
            entry.observer.finish_notify();
        }
        true
    }

    /// Drain the queue, including entries re-queued by the callbacks run.
    /// Returns the number of entries taken.
    pub fn dispatch_all(&self) -> usize {
        let mut n = 0;
        while self.dispatch_one() {
            n += 1;
        }
        n
    }
}
