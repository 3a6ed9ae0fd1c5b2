#![forbid(unsafe_code)]

//! Core: model points, the registry that owns them, and change dispatch.
//!
//! # Role in dm
//! `dm-core` is the shared-state layer. A [`Registry`] owns a set of named,
//! typed [`ModelPoint`]s behind one coarse lock. Threads write points
//! directly; threads that care about changes attach an [`Observer`] whose
//! callback runs on that observer's [`Dispatcher`], never on the writer.
//!
//! # Primary responsibilities
//! - **ModelPoint**: versioned value with valid/locked flags, lock-aware
//!   mutations, read-modify-write, text and binary marshaling.
//! - **RefCount**: saturating counter that notifies only on zero edges.
//! - **Registry**: name lookup and name-ordered traversal.
//! - **Observer**: per-subscription state machine
//!   (`idle → pending → notifying → idle`, `detached` from anywhere).
//! - **Dispatcher**: FIFO of pending observers, drained one at a time by the
//!   owning thread's run loop (see `dm-runtime`).
//!
//! # Delivery guarantee
//! Observers converge on the latest value; they are not guaranteed to see
//! every intermediate value. Any write that lands after an observer's
//! callback began produces a further notification.

pub mod dispatch;
pub mod observer;
pub mod point;
pub mod refcount;
pub mod registry;
pub mod text;
pub mod value;
pub mod version;

pub use dispatch::{Dispatcher, DispatcherConfig, Signal, SubscribeError};
pub use observer::{GenericObserver, Observer, Phase};
pub use point::{ElementRangeError, ImportOutcome, ModelPoint, PointRef, RmwOutcome, Snapshot};
pub use refcount::RefCount;
pub use registry::{PointId, Registry};
pub use text::TextError;
pub use value::{BoundedString, CodecError, FixedCodec, Integer, PointValue, Unsigned, merge_value};
pub use version::{LockRequest, Version};

/// Log and abort on a broken internal invariant.
///
/// Used only for programmer errors (cross-linked observers, detaching from
/// the wrong point). Caller-data errors are returned as `Err` instead.
#[track_caller]
pub(crate) fn fatal(msg: &str) -> ! {
    tracing::error!(target: "dm::fatal", "{msg}");
    panic!("dm fatal: {msg}");
}
