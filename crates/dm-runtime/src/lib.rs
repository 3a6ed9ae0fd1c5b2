#![forbid(unsafe_code)]

//! Runtime: the threads that deliver model point changes.
//!
//! # Role in dm
//! `dm-core` decides *who* must be told about a change; `dm-runtime` owns
//! the threads that do the telling. Each subscriber subsystem runs one
//! [`EventLoop`] on its own thread. The loop owns a [`dm_core::Dispatcher`],
//! a [`TimerManager`], and 32 event flags.
//!
//! # Primary responsibilities
//! - **EventLoop**: wait, then service flags, timers, and one notification.
//! - **TimerManager**: in-thread one-shot timers.
//! - **ChangeJournal**: JSONL record of observed changes.
//! - **logging**: global `tracing` subscriber setup for binaries.

pub mod change_journal;
pub mod event_loop;
pub mod logging;
pub mod timer;

pub use change_journal::{ChangeJournal, ChangeJournalConfig, JournalDestination};
pub use event_loop::{
    EVENT_FLAG_COUNT, EventLoop, EventLoopConfig, EventLoopHandle, LoopContext, LoopHandler,
    LoopNotifier,
};
pub use logging::{LogConfig, LoggingError};
pub use timer::{TimerId, TimerManager};
