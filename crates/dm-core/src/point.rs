#![forbid(unsafe_code)]

//! Model points: named, versioned, lock-aware shared values.
//!
//! # Design
//!
//! A point is a slot in its [`Registry`]. [`ModelPoint<T>`] is the typed
//! handle; it derefs to [`PointRef`], the untyped handle used for
//! operations that do not need to know `T` (lock, invalidate, text and
//! binary marshaling). Both are cheap to clone.
//!
//! Every mutation runs the same path under the registry lock:
//!
//! 1. apply the lock half of the [`LockRequest`]; a locked point with no
//!    request drops the mutation silently;
//! 2. apply the data half; stop if nothing changed;
//! 3. advance the version and move every stale idle observer onto its
//!    dispatcher's queue.
//!
//! # Invariants
//!
//! 1. The version changes iff an accepted mutation changed the value or
//!    validity, except [`PointRef::touch`] and [`PointRef::import`] which
//!    always advance it.
//! 2. Lock-state changes never advance the version.
//! 3. Failed text or binary input leaves the point untouched.
//!
//! # Failure Modes
//!
//! - The closure given to [`ModelPoint::read_modify_write`] runs with the
//!   registry lock held. Touching any point of the same registry from
//!   inside it deadlocks.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;

use serde_json::Value;

use crate::fatal;
use crate::observer::{GenericObserver, Observer};
use crate::registry::{ErasedValue, PointId, PointSlot, Registry};
use crate::text::{MergeAction, MergeRequest, PointText, TextError};
use crate::value::{CodecError, Integer, PointValue, Unsigned};
use crate::version::{LockRequest, Version};

/// Result of reading a point.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    /// Stored value; `None` while the point is invalid.
    pub value: Option<T>,
    /// Version at the time of the read.
    pub version: Version,
    /// Lock state at the time of the read.
    pub locked: bool,
}

impl<T> Snapshot<T> {
    /// True when the point held a valid value.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }
}

/// What a read-modify-write closure did to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmwOutcome {
    /// Leave the point as it was.
    NoChange,
    /// Buffer updated: mark valid, advance, notify.
    Changed,
    /// Mark the point invalid.
    Invalidate,
}

/// Result of a binary import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Version after the import.
    pub version: Version,
    /// Bytes consumed.
    pub consumed: usize,
}

/// Array element access outside the array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRangeError {
    pub start: usize,
    pub count: usize,
    pub len: usize,
}

impl fmt::Display for ElementRangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "elements {}..{} out of range for length {}",
            self.start,
            self.start.saturating_add(self.count),
            self.len
        )
    }
}

impl std::error::Error for ElementRangeError {}

// Slot-level operations shared by the typed and untyped handles and by
// `Registry::apply_json`. All run with the registry lock held.
impl PointSlot {
    pub(crate) fn write_boxed(&mut self, data: Box<dyn ErasedValue>, lock: LockRequest) -> Version {
        if self.admit(lock) && self.store(data) {
            self.advance();
        }
        self.version
    }

    pub(crate) fn invalidate(&mut self, lock: LockRequest) -> Version {
        if self.admit(lock) && self.valid {
            self.valid = false;
            self.data.clear_on_invalidate();
            self.advance();
        }
        self.version
    }

    pub(crate) fn set_lock(&mut self, lock: LockRequest) -> Version {
        self.admit(lock);
        self.version
    }

    pub(crate) fn apply_request(&mut self, request: &MergeRequest) -> Result<Version, TextError> {
        let lock = request.lock_request();
        match request.action()? {
            MergeAction::Invalidate => Ok(self.invalidate(lock)),
            MergeAction::Merge(val) => {
                let candidate = self.data.merged(&val)?;
                Ok(self.write_boxed(candidate, lock))
            }
            MergeAction::SetLock => Ok(self.set_lock(lock)),
        }
    }

    fn text(&self) -> PointText<'_> {
        PointText {
            name: &self.name,
            type_name: self.data.type_name(),
            valid: self.valid,
            seqnum: self.version,
            locked: self.locked,
            val: self.valid.then(|| self.data.to_json()),
        }
    }

    fn external_size(&self, include_lock: bool) -> usize {
        self.data.encoded_len() + 1 + usize::from(include_lock)
    }

    fn export(&self, include_lock: bool) -> Vec<u8> {
        let n = self.data.encoded_len();
        let mut out = vec![0u8; self.external_size(include_lock)];
        self.data.encode(&mut out[..n]);
        out[n] = u8::from(self.valid);
        if include_lock {
            out[n + 1] = u8::from(self.locked);
        }
        out
    }

    fn import(&mut self, src: &[u8], include_lock: bool) -> Result<ImportOutcome, CodecError> {
        let expected = self.external_size(include_lock);
        if src.len() != expected {
            return Err(CodecError::SizeMismatch {
                expected,
                actual: src.len(),
            });
        }
        let n = self.data.encoded_len();
        let data = self.data.decode_same(&src[..n])?;
        let valid = flag_byte(src[n], "valid")?;
        let locked = if include_lock {
            Some(flag_byte(src[n + 1], "locked")?)
        } else {
            None
        };
        self.data = data;
        self.valid = valid;
        if let Some(locked) = locked {
            self.locked = locked;
        }
        Ok(ImportOutcome {
            version: self.advance(),
            consumed: expected,
        })
    }

    fn typed<T: PointValue>(&self) -> &T {
        self.data
            .as_any()
            .downcast_ref::<T>()
            .unwrap_or_else(|| fatal("model point type mismatch"))
    }

    fn typed_mut<T: PointValue>(&mut self) -> &mut T {
        self.data
            .as_any_mut()
            .downcast_mut::<T>()
            .unwrap_or_else(|| fatal("model point type mismatch"))
    }

    fn snapshot<T: PointValue>(&self) -> Snapshot<T> {
        Snapshot {
            value: self.valid.then(|| self.typed::<T>().clone()),
            version: self.version,
            locked: self.locked,
        }
    }

    fn modify<T: PointValue>(
        &mut self,
        lock: LockRequest,
        f: impl FnOnce(&mut T, bool) -> RmwOutcome,
    ) -> Version {
        if !self.admit(lock) {
            return self.version;
        }
        let valid = self.valid;
        match f(self.typed_mut::<T>(), valid) {
            RmwOutcome::NoChange => {}
            RmwOutcome::Changed => {
                self.valid = true;
                self.advance();
            }
            RmwOutcome::Invalidate => {
                if self.valid {
                    self.valid = false;
                    self.data.clear_on_invalidate();
                    self.advance();
                }
            }
        }
        self.version
    }
}

fn flag_byte(byte: u8, what: &str) -> Result<bool, CodecError> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::InvalidValue(format!("{what} byte {other:#04x}"))),
    }
}

/// Untyped handle to a point.
#[derive(Clone)]
pub struct PointRef {
    registry: Registry,
    id: PointId,
}

impl fmt::Debug for PointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = self.registry.state();
        let slot = reg.slot(self.id);
        f.debug_struct("PointRef")
            .field("name", &slot.name)
            .field("version", &slot.version)
            .field("valid", &slot.valid)
            .field("locked", &slot.locked)
            .finish()
    }
}

impl PointRef {
    pub(crate) fn from_parts(registry: Registry, id: PointId) -> Self {
        Self { registry, id }
    }

    fn with_slot<R>(&self, f: impl FnOnce(&mut PointSlot) -> R) -> R {
        let mut reg = self.registry.state();
        f(reg.slot_mut(self.id))
    }

    /// Handle within the owning registry.
    #[must_use]
    pub fn id(&self) -> PointId {
        self.id
    }

    /// Owning registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.with_slot(|slot| slot.name.to_string())
    }

    #[must_use]
    pub fn type_name(&self) -> String {
        self.with_slot(|slot| slot.data.type_name())
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.with_slot(|slot| slot.version)
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.with_slot(|slot| slot.valid)
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.with_slot(|slot| slot.locked)
    }

    /// Mark the point invalid. Advances the version only on a valid to
    /// invalid transition.
    pub fn invalidate(&self, lock: LockRequest) -> Version {
        self.with_slot(|slot| slot.invalidate(lock))
    }

    /// Change only the lock flag. Never advances the version or notifies.
    pub fn set_lock(&self, lock: LockRequest) -> Version {
        self.with_slot(|slot| slot.set_lock(lock))
    }

    /// Advance the version and notify, regardless of value and lock.
    pub fn touch(&self) -> Version {
        self.with_slot(PointSlot::advance)
    }

    /// Text form as a JSON value.
    #[must_use]
    pub fn to_json_value(&self) -> Value {
        self.with_slot(|slot| serde_json::to_value(slot.text()).unwrap_or(Value::Null))
    }

    /// Text form `{"name", "type", "valid", "seqnum", "locked", "val"?}`.
    #[must_use]
    pub fn to_json(&self) -> String {
        self.with_slot(|slot| serde_json::to_string(&slot.text()).unwrap_or_default())
    }

    /// Apply a text-form update. The `"name"` key, if present, is ignored.
    ///
    /// `"valid": false` invalidates; otherwise `"val"` is merged in (object
    /// fields absent from it keep their values); a lone `"locked"` changes
    /// only the lock. A `"locked"` key accompanying data is applied with it.
    pub fn merge_json(&self, text: &str) -> Result<Version, TextError> {
        let request = MergeRequest::parse(text)?;
        self.with_slot(|slot| slot.apply_request(&request))
    }

    /// Length of the binary export.
    #[must_use]
    pub fn external_size(&self, include_lock: bool) -> usize {
        self.with_slot(|slot| slot.external_size(include_lock))
    }

    /// Binary form: value bytes, valid byte, and optionally the lock byte.
    #[must_use]
    pub fn export(&self, include_lock: bool) -> (Vec<u8>, Version) {
        self.with_slot(|slot| (slot.export(include_lock), slot.version))
    }

    /// Load the binary form. Ignores the current lock state, always
    /// advances the version, and notifies.
    pub fn import(&self, src: &[u8], include_lock: bool) -> Result<ImportOutcome, CodecError> {
        self.with_slot(|slot| slot.import(src, include_lock))
    }

    /// Attach a generic observer. See [`ModelPoint::attach`].
    pub fn attach(&self, observer: &GenericObserver, last_known: Version) {
        let mut reg = self.registry.state();
        observer
            .shared()
            .attach(&self.registry, &mut reg, self.id, last_known);
    }

    /// Detach a generic observer. See [`ModelPoint::detach`].
    pub fn detach(&self, observer: &GenericObserver) {
        let mut reg = self.registry.state();
        observer.shared().detach(&self.registry, &mut reg, self.id);
    }

    /// Text form as a JSON value, marked seen by `observer`.
    pub fn to_json_value_and_sync(&self, observer: &GenericObserver) -> Value {
        self.with_slot(|slot| {
            observer.shared().sync(slot.version);
            serde_json::to_value(slot.text()).unwrap_or(Value::Null)
        })
    }
}

/// Typed handle to a point holding a `T`.
pub struct ModelPoint<T> {
    point: PointRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ModelPoint<T> {
    fn clone(&self) -> Self {
        Self {
            point: self.point.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ModelPoint<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModelPoint").field(&self.point).finish()
    }
}

impl<T> Deref for ModelPoint<T> {
    type Target = PointRef;

    fn deref(&self) -> &PointRef {
        &self.point
    }
}

impl<T> AsRef<PointRef> for ModelPoint<T> {
    fn as_ref(&self) -> &PointRef {
        &self.point
    }
}

impl<T: PointValue> ModelPoint<T> {
    /// Register a new, invalid point named `name`.
    pub fn new(registry: &Registry, name: &str) -> Self {
        let id = registry.insert(name, Box::new(T::default()), false);
        Self::from_parts(registry.clone(), id)
    }

    /// Register a new point holding `value`.
    pub fn with_value(registry: &Registry, name: &str, value: T) -> Self {
        let id = registry.insert(name, Box::new(value), true);
        Self::from_parts(registry.clone(), id)
    }

    pub(crate) fn from_parts(registry: Registry, id: PointId) -> Self {
        Self {
            point: PointRef::from_parts(registry, id),
            _marker: PhantomData,
        }
    }

    fn with_slot<R>(&self, f: impl FnOnce(&mut PointSlot) -> R) -> R {
        self.point.with_slot(f)
    }

    /// Current value, version, and lock state.
    #[must_use]
    pub fn read(&self) -> Snapshot<T> {
        self.with_slot(|slot| slot.snapshot())
    }

    /// Read, and record the version as seen by `observer` so this value is
    /// not delivered to it again.
    pub fn read_and_sync(&self, observer: &Observer<T>) -> Snapshot<T> {
        self.with_slot(|slot| {
            observer.shared().sync(slot.version);
            slot.snapshot()
        })
    }

    /// Store `value` and mark the point valid.
    ///
    /// A no-op (same version returned) when the point is valid and `value`
    /// is not a change by [`PointValue::changes_from`], or when it is locked
    /// and `lock` is [`LockRequest::NoRequest`].
    pub fn write(&self, value: T, lock: LockRequest) -> Version {
        self.with_slot(|slot| slot.write_boxed(Box::new(value), lock))
    }

    /// Copy value and validity (not lock state) from `src`.
    pub fn copy_from(&self, src: &ModelPoint<T>, lock: LockRequest) -> Version {
        let snapshot = src.read();
        match snapshot.value {
            Some(value) => self.write(value, lock),
            None => self.invalidate(lock),
        }
    }

    /// Update the buffer in place under the registry lock.
    ///
    /// `f` receives the buffer and the current validity. The buffer holds
    /// the last valid value (or `T::default()`) while the point is invalid.
    /// [`RmwOutcome::Changed`] always advances the version.
    pub fn read_modify_write<F>(&self, lock: LockRequest, f: F) -> Version
    where
        F: FnOnce(&mut T, bool) -> RmwOutcome,
    {
        self.with_slot(|slot| slot.modify(lock, f))
    }

    /// Attach `observer`.
    ///
    /// With `last_known` equal to the current version the observer goes
    /// idle; otherwise (including [`Version::UNKNOWN`]) a notification is
    /// queued right away. Attaching an already attached observer restarts
    /// its subscription.
    ///
    /// # Panics
    ///
    /// Panics if the observer is idle or pending on another point.
    pub fn attach(&self, observer: &Observer<T>, last_known: Version) {
        let mut reg = self.point.registry.state();
        observer
            .shared()
            .attach(&self.point.registry, &mut reg, self.point.id, last_known);
    }

    /// Detach `observer`. Safe from inside its own callback; idempotent.
    ///
    /// # Panics
    ///
    /// Panics if the observer is attached to a different point.
    pub fn detach(&self, observer: &Observer<T>) {
        let mut reg = self.point.registry.state();
        observer
            .shared()
            .detach(&self.point.registry, &mut reg, self.point.id);
    }

    /// The untyped handle.
    #[must_use]
    pub fn as_point_ref(&self) -> &PointRef {
        &self.point
    }
}

impl<T: Integer> ModelPoint<T> {
    /// Add `n` (wrapping). An invalid point counts from its stored buffer.
    pub fn increment(&self, n: T, lock: LockRequest) -> Version {
        self.read_modify_write(lock, |v, _| {
            *v = v.wrapping_add(n);
            RmwOutcome::Changed
        })
    }

    /// Subtract `n` (wrapping).
    pub fn decrement(&self, n: T, lock: LockRequest) -> Version {
        self.read_modify_write(lock, |v, _| {
            *v = v.wrapping_sub(n);
            RmwOutcome::Changed
        })
    }
}

impl<T: Unsigned> ModelPoint<T> {
    pub fn set_bits(&self, mask: T, lock: LockRequest) -> Version {
        self.update_bits(lock, |v| v | mask)
    }

    pub fn clear_bits(&self, mask: T, lock: LockRequest) -> Version {
        self.update_bits(lock, |v| v & !mask)
    }

    pub fn flip_bits(&self, mask: T, lock: LockRequest) -> Version {
        self.update_bits(lock, |v| v ^ mask)
    }

    fn update_bits(&self, lock: LockRequest, op: impl FnOnce(T) -> T) -> Version {
        self.read_modify_write(lock, |v, valid| {
            let next = op(*v);
            if valid && next == *v {
                return RmwOutcome::NoChange;
            }
            *v = next;
            RmwOutcome::Changed
        })
    }
}

impl<T, const N: usize> ModelPoint<[T; N]>
where
    T: PointValue,
    [T; N]: PointValue,
{
    /// Copy out elements `start..start + count`.
    pub fn read_elements(&self, start: usize, count: usize) -> Result<Snapshot<Vec<T>>, ElementRangeError> {
        let end = element_range(start, count, N)?;
        Ok(self.with_slot(|slot| {
            let snapshot = slot.snapshot::<[T; N]>();
            Snapshot {
                value: snapshot.value.map(|all| all[start..end].to_vec()),
                version: snapshot.version,
                locked: snapshot.locked,
            }
        }))
    }

    /// Overwrite elements starting at `start`. The rest of the array keeps
    /// its stored content, even if the point was invalid.
    pub fn write_elements(&self, start: usize, elems: &[T], lock: LockRequest) -> Result<Version, ElementRangeError> {
        let end = element_range(start, elems.len(), N)?;
        Ok(self.read_modify_write(lock, |buf, valid| {
            if valid && buf[start..end] == *elems {
                return RmwOutcome::NoChange;
            }
            buf[start..end].clone_from_slice(elems);
            RmwOutcome::Changed
        }))
    }
}

fn element_range(start: usize, count: usize, len: usize) -> Result<usize, ElementRangeError> {
    match start.checked_add(count) {
        Some(end) if end <= len => Ok(end),
        _ => Err(ElementRangeError { start, count, len }),
    }
}
