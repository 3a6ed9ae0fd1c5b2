#![forbid(unsafe_code)]

//! Observer records and their subscription state machine.
//!
//! # Design
//!
//! An observer is a shared record ([`ObserverShared`]) holding a callback,
//! the [`Dispatcher`] it is delivered on, and a small state block:
//!
//! ```text
//!            attach (stale)          dispatcher pop
//! detached ─────────────────► pending ───────────► notifying
//!    │  attach (current)         ▲                   │ callback returns
//!    └──────────────► idle ──────┘ fan-out           ├─ version unchanged ─► idle
//!                                                    └─ version moved ─────► pending
//! ```
//!
//! `detach` reaches `detached` from any phase. Detaching during the
//! observer's own callback goes through `detach-pending` and completes when
//! the callback returns.
//!
//! # Invariants
//!
//! 1. An observer is bound to at most one point. It sits in that point's
//!    idle list only while `Idle`, and in its dispatcher queue only while
//!    `Pending`.
//! 2. Every enqueue bumps `ticket`. A queue entry whose ticket is stale is
//!    dropped without running the callback.
//! 3. Lock order: registry, then observer state, then dispatcher queue.
//!    The callback runs with none of them held.
//!
//! # Failure Modes
//!
//! - Attaching an idle or pending observer to a *different* point, or
//!   detaching from a point it is not bound to, is a programmer error and
//!   panics after logging.
//! - Dropping an [`Observer`] handle does not detach it. The point keeps
//!   the record alive until [`Observer::detach`] or a point-side detach.
//! - A panicking callback unwinds through the dispatcher's thread and
//!   leaves the observer in `Notifying`.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

use crate::dispatch::{Dispatcher, SubscribeError};
use crate::fatal;
use crate::point::{ModelPoint, PointRef};
use crate::registry::{PointId, PointSlot, Registry, RegistryInner, RegistryState};
use crate::value::PointValue;
use crate::version::Version;

/// Subscription phase of an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Attached and current; waiting for a change.
    Idle,
    /// Queued on its dispatcher.
    Pending,
    /// Callback running.
    Notifying,
    /// Detached from inside its callback; completes when it returns.
    DetachPending,
    /// Not attached to any point.
    Detached,
}

#[derive(Clone)]
pub(crate) struct Binding {
    registry: Weak<RegistryInner>,
    point: PointId,
}

impl Binding {
    fn new(registry: &Registry, point: PointId) -> Self {
        Self {
            registry: registry.downgrade(),
            point,
        }
    }

    fn is(&self, registry: &Registry, point: PointId) -> bool {
        self.point == point && registry.is_inner(&self.registry)
    }

    fn same(&self, other: &Self) -> bool {
        self.point == other.point && Weak::ptr_eq(&self.registry, &other.registry)
    }

    fn upgrade(&self) -> Option<Registry> {
        self.registry.upgrade().map(Registry::from_inner)
    }
}

pub(crate) struct ObserverState {
    pub(crate) phase: Phase,
    pub(crate) last_seen: Version,
    pub(crate) ticket: u64,
    binding: Option<Binding>,
}

impl ObserverState {
    fn bound_to(&self, registry: &Registry, point: PointId) -> bool {
        self.binding.as_ref().is_some_and(|b| b.is(registry, point))
    }

    fn still(&self, binding: &Binding) -> bool {
        self.binding.as_ref().is_some_and(|b| b.same(binding))
    }

    fn clear(&mut self) {
        self.phase = Phase::Detached;
        self.binding = None;
    }
}

type Callback = Box<dyn FnMut(&Registry, PointId, &Arc<ObserverShared>) + Send>;

/// Shared observer record.
pub(crate) struct ObserverShared {
    dispatcher: Dispatcher,
    state: Mutex<ObserverState>,
    callback: Mutex<Callback>,
}

impl Drop for ObserverShared {
    fn drop(&mut self) {
        self.dispatcher.release_observer();
    }
}

impl ObserverShared {
    fn new(dispatcher: &Dispatcher, callback: Callback) -> Result<Arc<Self>, SubscribeError> {
        dispatcher.reserve_observer()?;
        Ok(Arc::new(Self {
            dispatcher: dispatcher.clone(),
            state: Mutex::new(ObserverState {
                phase: Phase::Detached,
                last_seen: Version::UNKNOWN,
                ticket: 0,
                binding: None,
            }),
            callback: Mutex::new(callback),
        }))
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ObserverState> {
        self.state.lock().expect("observer state lock poisoned")
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Fan-out step for one idle observer. Caller holds the registry lock.
    pub(crate) fn schedule_if_stale(self: &Arc<Self>, version: Version) -> bool {
        let mut state = self.lock_state();
        if state.last_seen == version {
            return false;
        }
        state.phase = Phase::Pending;
        self.dispatcher.enqueue(self, &mut state);
        true
    }

    /// Put the observer in the slot's idle list or its dispatcher's queue,
    /// depending on whether it is current.
    fn subscribe(self: &Arc<Self>, slot: &mut PointSlot, state: &mut ObserverState) {
        if state.last_seen == slot.version {
            state.phase = Phase::Idle;
            slot.observers.push(Arc::clone(self));
        } else {
            state.phase = Phase::Pending;
            self.dispatcher.enqueue(self, state);
        }
    }

    /// Attach to `point`. Caller holds the registry lock.
    pub(crate) fn attach(
        self: &Arc<Self>,
        registry: &Registry,
        reg: &mut RegistryState,
        point: PointId,
        last_known: Version,
    ) {
        let mut state = self.lock_state();
        let slot = reg.slot_mut(point);
        match state.phase {
            Phase::Detached => {
                state.binding = Some(Binding::new(registry, point));
                state.last_seen = last_known;
                self.subscribe(slot, &mut state);
            }
            Phase::Idle | Phase::Pending => {
                if !state.bound_to(registry, point) {
                    fatal("attach: observer is still attached to another point");
                }
                if state.phase == Phase::Idle {
                    slot.remove_observer(self);
                } else {
                    self.dispatcher.remove(self);
                }
                state.last_seen = last_known;
                self.subscribe(slot, &mut state);
            }
            Phase::Notifying => {
                state.binding = Some(Binding::new(registry, point));
                state.last_seen = last_known;
            }
            Phase::DetachPending => {
                state.binding = Some(Binding::new(registry, point));
                state.last_seen = last_known;
                state.phase = Phase::Notifying;
            }
        }
        debug!(
            point = %slot.name,
            %last_known,
            phase = ?state.phase,
            dispatcher = %self.dispatcher.name(),
            "dm.attach"
        );
    }

    /// Detach from `point`. Caller holds the registry lock.
    pub(crate) fn detach(self: &Arc<Self>, registry: &Registry, reg: &mut RegistryState, point: PointId) {
        let mut state = self.lock_state();
        self.detach_locked(registry, reg, point, &mut state);
    }

    fn detach_locked(
        self: &Arc<Self>,
        registry: &Registry,
        reg: &mut RegistryState,
        point: PointId,
        state: &mut ObserverState,
    ) {
        if state.phase == Phase::Detached {
            return;
        }
        if !state.bound_to(registry, point) {
            fatal("detach: observer is not attached to this point");
        }
        let slot = reg.slot_mut(point);
        match state.phase {
            Phase::Idle => {
                slot.remove_observer(self);
                state.clear();
            }
            Phase::Pending => {
                self.dispatcher.remove(self);
                state.clear();
            }
            Phase::Notifying => state.phase = Phase::DetachPending,
            Phase::DetachPending | Phase::Detached => {}
        }
        debug!(point = %slot.name, phase = ?state.phase, "dm.detach");
    }

    /// Detach from whatever point the observer is bound to.
    pub(crate) fn detach_current(self: &Arc<Self>) {
        loop {
            let binding = {
                let mut state = self.lock_state();
                if state.phase == Phase::Detached {
                    return;
                }
                match state.binding.clone() {
                    Some(binding) => binding,
                    None => {
                        state.clear();
                        return;
                    }
                }
            };
            let Some(registry) = binding.upgrade() else {
                self.lock_state().clear();
                return;
            };
            let mut reg = registry.state();
            let mut state = self.lock_state();
            if !state.still(&binding) {
                // Re-targeted between the two locks; look again.
                continue;
            }
            self.detach_locked(&registry, &mut reg, binding.point, &mut state);
            return;
        }
    }

    /// Sync `last_seen` to the point's current version. Caller holds the
    /// registry lock.
    pub(crate) fn sync(&self, version: Version) {
        self.lock_state().last_seen = version;
    }

    /// Dispatcher pop: `pending → notifying`. Returns the bound point, or
    /// `None` when the queue entry is stale.
    pub(crate) fn begin_notify(self: &Arc<Self>, ticket: u64) -> Option<(Registry, PointId, Arc<str>)> {
        loop {
            let binding = {
                let state = self.lock_state();
                if state.ticket != ticket || state.phase != Phase::Pending {
                    return None;
                }
                state.binding.clone()?
            };
            let Some(registry) = binding.upgrade() else {
                let mut state = self.lock_state();
                if state.ticket == ticket {
                    state.clear();
                }
                return None;
            };
            let (version, name) = {
                let reg = registry.state();
                let mut state = self.lock_state();
                if state.ticket != ticket || state.phase != Phase::Pending {
                    return None;
                }
                if !state.still(&binding) {
                    continue;
                }
                let slot = reg.slot(binding.point);
                state.phase = Phase::Notifying;
                state.last_seen = slot.version;
                (slot.version, Arc::clone(&slot.name))
            };
            tracing::trace!(point = %name, %version, "dm.notify");
            return Some((registry, binding.point, name));
        }
    }

    /// Run the callback. No lock other than the callback's own is held.
    pub(crate) fn invoke(self: &Arc<Self>, registry: &Registry, point: PointId) {
        let mut callback = self.callback.lock().expect("observer callback lock poisoned");
        (callback.as_mut())(registry, point, self);
    }

    /// Callback returned: settle into idle, re-queue, or finish a detach.
    pub(crate) fn finish_notify(self: &Arc<Self>) {
        loop {
            let binding = {
                let mut state = self.lock_state();
                match state.phase {
                    Phase::DetachPending => {
                        state.clear();
                        return;
                    }
                    Phase::Notifying => match state.binding.clone() {
                        Some(binding) => binding,
                        None => {
                            state.clear();
                            return;
                        }
                    },
                    _ => return,
                }
            };
            let Some(registry) = binding.upgrade() else {
                self.lock_state().clear();
                return;
            };
            let mut reg = registry.state();
            let mut state = self.lock_state();
            match state.phase {
                Phase::DetachPending => {
                    state.clear();
                    return;
                }
                Phase::Notifying if state.still(&binding) => {
                    self.subscribe(reg.slot_mut(binding.point), &mut state);
                    return;
                }
                Phase::Notifying => continue,
                _ => return,
            }
        }
    }
}

/// Typed observer of a [`ModelPoint<T>`].
///
/// Cloning shares the same record. The callback runs on the observer's
/// dispatcher thread and receives the point it is attached to plus a handle
/// to itself, so it may re-attach or detach from inside the callback.
pub struct Observer<T> {
    shared: Arc<ObserverShared>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Observer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Observer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("Observer")
            .field("phase", &state.phase)
            .field("last_seen", &state.last_seen)
            .field("dispatcher", &self.shared.dispatcher.name())
            .finish()
    }
}

impl<T: PointValue> Observer<T> {
    /// Create a detached observer delivered on `dispatcher`.
    pub fn new<F>(dispatcher: &Dispatcher, mut callback: F) -> Result<Self, SubscribeError>
    where
        F: FnMut(&ModelPoint<T>, &Observer<T>) + Send + 'static,
    {
        let shared = ObserverShared::new(
            dispatcher,
            Box::new(move |registry: &Registry, point: PointId, shared: &Arc<ObserverShared>| {
                let point = ModelPoint::from_parts(registry.clone(), point);
                let observer = Observer::from_shared(Arc::clone(shared));
                callback(&point, &observer);
            }),
        )?;
        Ok(Self::from_shared(shared))
    }
}

impl<T> Observer<T> {
    fn from_shared(shared: Arc<ObserverShared>) -> Self {
        Self {
            shared,
            _marker: PhantomData,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ObserverShared> {
        &self.shared
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.lock_state().phase
    }

    /// Version recorded when the last notification began (or as supplied
    /// at attach / synced by a read).
    #[must_use]
    pub fn last_seen(&self) -> Version {
        self.shared.lock_state().last_seen
    }

    /// True unless detached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        !matches!(self.phase(), Phase::Detached | Phase::DetachPending)
    }

    /// Dispatcher this observer is delivered on.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        self.shared.dispatcher()
    }

    /// Detach from the bound point. No-op when already detached.
    pub fn detach(&self) {
        self.shared.detach_current();
    }

    /// True when both handles share the same record.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// Observer of any point, seen through its untyped [`PointRef`].
///
/// Used by consumers that handle many value types uniformly (journals,
/// persistence), typically via the text or binary form.
#[derive(Clone)]
pub struct GenericObserver {
    shared: Arc<ObserverShared>,
}

impl fmt::Debug for GenericObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("GenericObserver")
            .field("phase", &state.phase)
            .field("last_seen", &state.last_seen)
            .finish()
    }
}

impl GenericObserver {
    /// Create a detached observer delivered on `dispatcher`.
    pub fn new<F>(dispatcher: &Dispatcher, mut callback: F) -> Result<Self, SubscribeError>
    where
        F: FnMut(&PointRef, &GenericObserver) + Send + 'static,
    {
        let shared = ObserverShared::new(
            dispatcher,
            Box::new(move |registry: &Registry, point: PointId, shared: &Arc<ObserverShared>| {
                let point = PointRef::from_parts(registry.clone(), point);
                let observer = GenericObserver {
                    shared: Arc::clone(shared),
                };
                callback(&point, &observer);
            }),
        )?;
        Ok(Self { shared })
    }

    pub(crate) fn shared(&self) -> &Arc<ObserverShared> {
        &self.shared
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.lock_state().phase
    }

    /// See [`Observer::last_seen`].
    #[must_use]
    pub fn last_seen(&self) -> Version {
        self.shared.lock_state().last_seen
    }

    /// Detach from the bound point. No-op when already detached.
    pub fn detach(&self) {
        self.shared.detach_current();
    }
}
