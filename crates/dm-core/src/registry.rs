#![forbid(unsafe_code)]

//! Registry: owner of a set of model points and their shared lock.
//!
//! # Design
//!
//! Points live in slot storage (`Vec<PointSlot>`) addressed by stable
//! [`PointId`] handles; a name index maps names to handles. One mutex guards
//! the whole [`RegistryState`], so every point operation in a registry is
//! serialized. Critical sections are short: no observer callback ever runs
//! while this lock is held.
//!
//! Name-ordered traversal uses a cached stable sort of the slot names. The
//! cache is dropped on every insert and rebuilt on the next ordered request.
//!
//! # Invariants
//!
//! 1. Slots are never removed; a `PointId` stays valid for the registry's
//!    lifetime.
//! 2. With duplicate names, [`Registry::lookup`] returns the first
//!    registered point. Every duplicate still appears in ordered traversal.
//! 3. A slot's `observers` list holds only observers in the idle phase.
//!
//! # Performance
//!
//! | Operation       | Complexity |
//! |-----------------|------------|
//! | `lookup()`      | O(1) average |
//! | `first_by_name()` / `next_by_name()` | O(1) cached, O(P log P) after an insert |
//! | mutation fan-out | O(attached observers) |

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tracing::{debug, warn};

use crate::fatal;
use crate::observer::ObserverShared;
use crate::point::{ModelPoint, PointRef};
use crate::text::{MergeRequest, TextError};
use crate::value::{CodecError, PointValue};
use crate::version::{LockRequest, Version};

/// Stable handle of a point inside its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointId(u32);

impl PointId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Type-erased point datum.
pub(crate) trait ErasedValue: Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn type_name(&self) -> String;
    fn to_json(&self) -> Value;
    /// Copy of `self` with `patch` merged in; `self` is untouched.
    fn merged(&self, patch: &Value) -> Result<Box<dyn ErasedValue>, TextError>;
    /// Whether storing `self` over `previous` on a valid point is a change.
    fn differs_from(&self, previous: &dyn ErasedValue) -> bool;
    fn clear_on_invalidate(&mut self);
    fn encoded_len(&self) -> usize;
    fn encode(&self, out: &mut [u8]);
    /// Decode a value of the same concrete type.
    fn decode_same(&self, src: &[u8]) -> Result<Box<dyn ErasedValue>, CodecError>;
    fn boxed_clone(&self) -> Box<dyn ErasedValue>;
}

impl<T: PointValue> ErasedValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn type_name(&self) -> String {
        <T as PointValue>::type_name()
    }

    fn to_json(&self) -> Value {
        PointValue::to_json(self)
    }

    fn merged(&self, patch: &Value) -> Result<Box<dyn ErasedValue>, TextError> {
        let mut next = self.clone();
        next.merge_json(patch)?;
        Ok(Box::new(next))
    }

    fn differs_from(&self, previous: &dyn ErasedValue) -> bool {
        previous
            .as_any()
            .downcast_ref::<T>()
            .is_none_or(|prev| PointValue::changes_from(self, prev))
    }

    fn clear_on_invalidate(&mut self) {
        PointValue::on_invalidate(self);
    }

    fn encoded_len(&self) -> usize {
        T::SIZE
    }

    fn encode(&self, out: &mut [u8]) {
        crate::value::FixedCodec::encode(self, out);
    }

    fn decode_same(&self, src: &[u8]) -> Result<Box<dyn ErasedValue>, CodecError> {
        Ok(Box::new(<T as crate::value::FixedCodec>::decode(src)?))
    }

    fn boxed_clone(&self) -> Box<dyn ErasedValue> {
        Box::new(self.clone())
    }
}

/// One point's storage.
pub(crate) struct PointSlot {
    pub(crate) name: Arc<str>,
    pub(crate) version: Version,
    pub(crate) valid: bool,
    pub(crate) locked: bool,
    /// Idle observers only.
    pub(crate) observers: Vec<Arc<ObserverShared>>,
    pub(crate) data: Box<dyn ErasedValue>,
}

impl PointSlot {
    /// Apply the lock half of a request. Returns whether the data half may
    /// proceed.
    pub(crate) fn admit(&mut self, lock: LockRequest) -> bool {
        match lock {
            LockRequest::Unlock => {
                self.locked = false;
                true
            }
            LockRequest::Lock => {
                self.locked = true;
                true
            }
            LockRequest::NoRequest => !self.locked,
        }
    }

    /// Store `data` and mark valid. Returns whether anything changed.
    ///
    /// A valid point whose shape reports no change still takes the new
    /// buffer, without a version bump.
    pub(crate) fn store(&mut self, data: Box<dyn ErasedValue>) -> bool {
        if self.valid && !data.differs_from(&*self.data) {
            self.data = data;
            return false;
        }
        self.data = data;
        self.valid = true;
        true
    }

    /// Advance the version and schedule every stale attached observer.
    pub(crate) fn advance(&mut self) -> Version {
        self.version = self.version.next();
        self.fan_out();
        self.version
    }

    fn fan_out(&mut self) {
        let version = self.version;
        let attached = std::mem::take(&mut self.observers);
        let mut scheduled = 0usize;
        for observer in attached {
            if observer.schedule_if_stale(version) {
                scheduled += 1;
            } else {
                self.observers.push(observer);
            }
        }
        tracing::trace!(point = %self.name, %version, scheduled, "dm.fan_out");
    }

    pub(crate) fn remove_observer(&mut self, observer: &Arc<ObserverShared>) {
        self.observers.retain(|o| !Arc::ptr_eq(o, observer));
    }
}

struct NameOrder {
    ids: Vec<PointId>,
    /// `rank[id]` = position of `id` in `ids`.
    rank: Vec<usize>,
}

/// Everything guarded by the registry lock.
pub(crate) struct RegistryState {
    points: Vec<PointSlot>,
    index: HashMap<Arc<str>, PointId>,
    order: Option<NameOrder>,
}

impl RegistryState {
    pub(crate) fn slot(&self, id: PointId) -> &PointSlot {
        &self.points[id.index()]
    }

    pub(crate) fn slot_mut(&mut self, id: PointId) -> &mut PointSlot {
        &mut self.points[id.index()]
    }

    fn order(&mut self) -> &NameOrder {
        let points = &self.points;
        self.order.get_or_insert_with(|| {
            let mut ids: Vec<PointId> = (0..points.len())
                .map(|i| PointId(i as u32))
                .collect();
            // Stable: duplicates keep registration order.
            ids.sort_by(|a, b| points[a.index()].name.cmp(&points[b.index()].name));
            let mut rank = vec![0; ids.len()];
            for (pos, id) in ids.iter().enumerate() {
                rank[id.index()] = pos;
            }
            NameOrder { ids, rank }
        })
    }
}

pub(crate) struct RegistryInner {
    state: Mutex<RegistryState>,
}

/// Owner of a set of model points.
///
/// Cloning shares the same registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState {
                    points: Vec::new(),
                    index: HashMap::new(),
                    order: None,
                }),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn is_inner(&self, inner: &Weak<RegistryInner>) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.inner), inner.as_ptr())
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.state.lock().expect("registry lock poisoned")
    }

    /// Register a new slot. Called once per point construction.
    pub(crate) fn insert(&self, name: &str, data: Box<dyn ErasedValue>, valid: bool) -> PointId {
        let mut state = self.state();
        let id = PointId(u32::try_from(state.points.len()).unwrap_or_else(|_| {
            fatal("registry full")
        }));
        let name: Arc<str> = Arc::from(name);
        if state.index.contains_key(&name) {
            warn!(point = %name, "duplicate model point name; lookup returns the first");
        } else {
            state.index.insert(Arc::clone(&name), id);
        }
        debug!(point = %name, type_name = %data.type_name(), valid, "dm.register");
        state.points.push(PointSlot {
            name,
            version: Version::INITIAL,
            valid,
            locked: false,
            observers: Vec::new(),
            data,
        });
        state.order = None;
        id
    }

    /// Number of registered points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().points.len()
    }

    /// True when no point is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find a point by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<PointRef> {
        let id = self.state().index.get(name).copied()?;
        Some(PointRef::from_parts(self.clone(), id))
    }

    /// Find a point by name and value type. `None` when absent or when the
    /// stored type is not `T`.
    #[must_use]
    pub fn lookup_typed<T: PointValue>(&self, name: &str) -> Option<ModelPoint<T>> {
        let state = self.state();
        let id = state.index.get(name).copied()?;
        if !state.slot(id).data.as_any().is::<T>() {
            return None;
        }
        drop(state);
        Some(ModelPoint::from_parts(self.clone(), id))
    }

    /// First point in name order.
    #[must_use]
    pub fn first_by_name(&self) -> Option<PointRef> {
        let mut state = self.state();
        let id = state.order().ids.first().copied()?;
        Some(PointRef::from_parts(self.clone(), id))
    }

    /// Point following `current` in name order.
    ///
    /// # Panics
    ///
    /// Panics if `current` belongs to another registry.
    #[must_use]
    pub fn next_by_name(&self, current: &PointRef) -> Option<PointRef> {
        if !current.registry().ptr_eq(self) {
            fatal("next_by_name: point belongs to another registry");
        }
        let mut state = self.state();
        let order = state.order();
        let pos = order.rank[current.id().index()];
        let id = order.ids.get(pos + 1).copied()?;
        Some(PointRef::from_parts(self.clone(), id))
    }

    /// Every point in name order.
    #[must_use]
    pub fn points_by_name(&self) -> Vec<PointRef> {
        let ids = self.state().order().ids.clone();
        ids.into_iter()
            .map(|id| PointRef::from_parts(self.clone(), id))
            .collect()
    }

    /// Every point name in name order.
    #[must_use]
    pub fn names_by_name(&self) -> Vec<String> {
        let mut state = self.state();
        let ids = state.order().ids.clone();
        ids.into_iter()
            .map(|id| state.slot(id).name.to_string())
            .collect()
    }

    /// Apply a text-form update `{"name": .., "val"|"valid"|"locked": ..}` to
    /// the named point.
    ///
    /// Returns the point and its version after the update.
    pub fn apply_json(&self, text: &str) -> Result<(PointRef, Version), TextError> {
        let request = MergeRequest::parse(text)?;
        let name = request.name.as_deref().ok_or(TextError::MissingName)?;
        let point = self
            .lookup(name)
            .ok_or_else(|| TextError::UnknownPoint(name.to_string()))?;
        let version = {
            let mut state = self.state();
            state.slot_mut(point.id()).apply_request(&request)?
        };
        Ok((point, version))
    }
}
