#![forbid(unsafe_code)]

//! Subscriber thread run loop: event flags, timers, and one dispatcher.
//!
//! # Design
//!
//! Every wake-up source (event flag, stop request, dispatcher enqueue)
//! raises one shared [`Signal`]. Each iteration of the loop:
//!
//! 1. waits on the signal unless work is already known to be waiting, for
//!    at most the time until the next timer deadline (capped by the
//!    configured idle timeout);
//! 2. delivers raised event flags, lowest flag first;
//! 3. delivers expired timers, in deadline order;
//! 4. delivers **one** pending change notification.
//!
//! Delivering a single notification per iteration keeps flags and timers
//! serviced while a burst of changes drains.
//!
//! # Invariants
//!
//! 1. Handler hooks and observer callbacks run only on the loop's thread.
//! 2. `start` runs before the first iteration; `stop` runs after the last.
//! 3. A stop request ends the loop at the next iteration boundary; queued
//!    notifications are discarded, not drained.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dm_core::{Dispatcher, DispatcherConfig, Signal};
use tracing::{debug, info};

use crate::timer::{TimerId, TimerManager};

/// Number of event flags per loop.
pub const EVENT_FLAG_COUNT: u8 = 32;

/// Event loop configuration.
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Thread name.
    pub name: String,
    /// Longest single wait when nothing is scheduled.
    pub idle_timeout: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            name: "dm-loop".to_string(),
            idle_timeout: Duration::from_millis(100),
        }
    }
}

impl EventLoopConfig {
    /// Set the thread name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the idle wait. Zero is clamped to 1 ms.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout.max(Duration::from_millis(1));
        self
    }
}

/// Hooks run by the loop on its own thread. All default to no-ops.
pub trait LoopHandler: Send + 'static {
    /// Once, before the first iteration.
    fn start(&mut self, _ctx: &mut LoopContext<'_>) {}

    /// Event flag `flag` was raised since the last iteration.
    fn event_flag(&mut self, _flag: u8, _ctx: &mut LoopContext<'_>) {}

    /// Timer `id` expired.
    fn timer_expired(&mut self, _id: TimerId, _ctx: &mut LoopContext<'_>) {}

    /// Once, after the last iteration.
    fn stop(&mut self, _ctx: &mut LoopContext<'_>) {}
}

impl LoopHandler for () {}

/// What a handler hook can reach.
pub struct LoopContext<'a> {
    pub timers: &'a mut TimerManager,
    pub dispatcher: &'a Dispatcher,
    notifier: &'a LoopNotifier,
}

impl LoopContext<'_> {
    /// Ask the loop to stop after this iteration.
    pub fn please_stop(&self) {
        self.notifier.please_stop();
    }

    /// Handle for raising flags on this loop from other threads.
    #[must_use]
    pub fn notifier(&self) -> LoopNotifier {
        self.notifier.clone()
    }
}

struct Shared {
    flags: AtomicU32,
    stopping: AtomicBool,
    signal: Arc<Signal>,
}

/// Thread-safe handle that raises event flags and stop requests on a loop.
#[derive(Clone)]
pub struct LoopNotifier {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LoopNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopNotifier")
            .field("flags", &self.shared.flags.load(Ordering::Relaxed))
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

impl LoopNotifier {
    /// Raise event flag `flag` (0..32).
    ///
    /// # Panics
    ///
    /// Panics if `flag >= 32`.
    pub fn notify(&self, flag: u8) {
        assert!(flag < EVENT_FLAG_COUNT, "event flag out of range: {flag}");
        self.shared.flags.fetch_or(1 << flag, Ordering::AcqRel);
        self.shared.signal.raise();
    }

    /// Ask the loop to stop.
    pub fn please_stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.signal.raise();
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }
}

/// A subscriber run loop, not yet bound to a thread.
///
/// Tests drive it with [`EventLoop::run_once`]; applications call
/// [`EventLoop::spawn`].
pub struct EventLoop {
    config: EventLoopConfig,
    dispatcher: Dispatcher,
    timers: TimerManager,
    notifier: LoopNotifier,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.config.name)
            .field("timers", &self.timers.len())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl EventLoop {
    #[must_use]
    pub fn new(config: EventLoopConfig, dispatcher_config: DispatcherConfig) -> Self {
        let signal = Arc::new(Signal::new());
        let dispatcher = Dispatcher::with_signal(dispatcher_config, Arc::clone(&signal));
        let config = EventLoopConfig {
            idle_timeout: config.idle_timeout.max(Duration::from_millis(1)),
            ..config
        };
        Self {
            config,
            dispatcher,
            timers: TimerManager::new(),
            notifier: LoopNotifier {
                shared: Arc::new(Shared {
                    flags: AtomicU32::new(0),
                    stopping: AtomicBool::new(false),
                    signal,
                }),
            },
        }
    }

    /// Dispatcher whose callbacks run on this loop.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn notifier(&self) -> LoopNotifier {
        self.notifier.clone()
    }

    /// Timers of this loop, for arming before the loop starts.
    pub fn timers_mut(&mut self) -> &mut TimerManager {
        &mut self.timers
    }

    fn context(&mut self) -> LoopContext<'_> {
        LoopContext {
            timers: &mut self.timers,
            dispatcher: &self.dispatcher,
            notifier: &self.notifier,
        }
    }

    /// True when an iteration would find something to do right now.
    #[must_use]
    pub fn has_work(&self) -> bool {
        self.notifier.shared.flags.load(Ordering::Acquire) != 0
            || self.dispatcher.has_pending()
            || self
                .timers
                .next_deadline()
                .is_some_and(|deadline| deadline <= Instant::now())
    }

    fn wait_timeout(&self) -> Duration {
        let idle = self.config.idle_timeout;
        match self.timers.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(idle),
            None => idle,
        }
    }

    /// Run one iteration. With `wait`, block first until something needs
    /// doing or the wait times out.
    ///
    /// Returns whether more work is immediately available.
    pub fn run_once<H: LoopHandler>(&mut self, handler: &mut H, wait: bool) -> bool {
        if wait && !self.has_work() && !self.notifier.is_stopping() {
            let timeout = self.wait_timeout();
            if !timeout.is_zero() {
                self.dispatcher.signal().wait_timeout(timeout);
            }
        }

        let flags = self.notifier.shared.flags.swap(0, Ordering::AcqRel);
        let mut ctx = self.context();
        for flag in 0..EVENT_FLAG_COUNT {
            if flags & (1 << flag) != 0 {
                handler.event_flag(flag, &mut ctx);
            }
        }

        for id in ctx.timers.process(Instant::now()) {
            handler.timer_expired(id, &mut ctx);
        }

        self.dispatcher.dispatch_one();
        self.has_work()
    }

    /// Run until a stop request, calling the handler's `start` and `stop`
    /// hooks around the iterations.
    pub fn run<H: LoopHandler>(&mut self, handler: &mut H) {
        info!(event_loop = %self.config.name, "dm.loop.start");
        handler.start(&mut self.context());
        let mut iterations: u64 = 0;
        while !self.notifier.is_stopping() {
            self.run_once(handler, true);
            iterations += 1;
        }
        handler.stop(&mut self.context());
        let discarded = self.dispatcher.discard_pending();
        info!(
            event_loop = %self.config.name,
            iterations,
            discarded,
            "dm.loop.stop"
        );
    }

    /// Move the loop onto a named thread running `handler`.
    pub fn spawn<H: LoopHandler>(mut self, mut handler: H) -> io::Result<EventLoopHandle> {
        let name = self.config.name.clone();
        let dispatcher = self.dispatcher.clone();
        let notifier = self.notifier.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run(&mut handler))?;
        debug!(event_loop = %name, "dm.loop.spawned");
        Ok(EventLoopHandle {
            name,
            dispatcher,
            notifier,
            handle: Some(handle),
        })
    }
}

/// Owner of a running event loop thread. Dropping it stops and joins the
/// thread.
pub struct EventLoopHandle {
    name: String,
    dispatcher: Dispatcher,
    notifier: LoopNotifier,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for EventLoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopHandle")
            .field("name", &self.name)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl EventLoopHandle {
    /// Dispatcher to create observers on; their callbacks run on this loop.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn notifier(&self) -> LoopNotifier {
        self.notifier.clone()
    }

    /// Raise event flag `flag`. See [`LoopNotifier::notify`].
    pub fn notify(&self, flag: u8) {
        self.notifier.notify(flag);
    }

    pub fn please_stop(&self) {
        self.notifier.please_stop();
    }

    /// Stop the loop and wait for its thread. Returns the thread's panic
    /// payload if a hook or callback panicked.
    pub fn join(mut self) -> thread::Result<()> {
        self.notifier.please_stop();
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

impl Drop for EventLoopHandle {
    fn drop(&mut self) {
        self.notifier.please_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_core::{LockRequest, ModelPoint, Observer, Registry};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        flags: Vec<u8>,
        timers: Vec<TimerId>,
        started: bool,
        stopped: bool,
    }

    impl LoopHandler for Recorder {
        fn start(&mut self, _ctx: &mut LoopContext<'_>) {
            self.started = true;
        }
        fn event_flag(&mut self, flag: u8, _ctx: &mut LoopContext<'_>) {
            self.flags.push(flag);
        }
        fn timer_expired(&mut self, id: TimerId, _ctx: &mut LoopContext<'_>) {
            self.timers.push(id);
        }
        fn stop(&mut self, _ctx: &mut LoopContext<'_>) {
            self.stopped = true;
        }
    }

    fn new_loop() -> EventLoop {
        EventLoop::new(
            EventLoopConfig::default().with_idle_timeout(Duration::from_millis(5)),
            DispatcherConfig::default().with_name("test"),
        )
    }

    #[test]
    fn flags_delivered_lowest_first_and_cleared() {
        let mut event_loop = new_loop();
        let mut handler = Recorder::default();
        let notifier = event_loop.notifier();
        notifier.notify(7);
        notifier.notify(0);
        notifier.notify(7);
        assert!(event_loop.has_work());
        assert!(!event_loop.run_once(&mut handler, false));
        assert_eq!(handler.flags, vec![0, 7]);
        event_loop.run_once(&mut handler, false);
        assert_eq!(handler.flags, vec![0, 7]);
    }

    #[test]
    #[should_panic(expected = "event flag out of range")]
    fn flag_out_of_range_panics() {
        new_loop().notifier().notify(32);
    }

    #[test]
    fn zero_idle_timeout_is_clamped() {
        let config = EventLoopConfig::default().with_idle_timeout(Duration::ZERO);
        assert_eq!(config.idle_timeout, Duration::from_millis(1));
    }

    #[test]
    fn expired_timer_fires_once() {
        let mut event_loop = new_loop();
        let mut handler = Recorder::default();
        let id = event_loop.timers_mut().start(Duration::ZERO);
        event_loop.run_once(&mut handler, false);
        event_loop.run_once(&mut handler, false);
        assert_eq!(handler.timers, vec![id]);
    }

    #[test]
    fn one_notification_per_iteration() {
        let registry = Registry::new();
        let mut event_loop = new_loop();
        let mut handler = ();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut observers = Vec::new();
        for name in ["a", "b"] {
            let point = ModelPoint::<u8>::new(&registry, name);
            let sink = Arc::clone(&seen);
            let observer = Observer::new(event_loop.dispatcher(), move |p: &ModelPoint<u8>, _: &Observer<u8>| {
                sink.lock().unwrap().push(p.name());
            })
            .unwrap();
            point.attach(&observer, point.version());
            point.write(1, LockRequest::NoRequest);
            observers.push(observer);
        }
        assert!(event_loop.run_once(&mut handler, false));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(!event_loop.run_once(&mut handler, false));
        assert_eq!(*seen.lock().unwrap(), ["a", "b"]);
    }

    #[test]
    fn stop_discards_undelivered_notifications() {
        let registry = Registry::new();
        let mut event_loop = new_loop();
        let point = ModelPoint::<u8>::new(&registry, "p");
        let observer = Observer::new(event_loop.dispatcher(), |_: &ModelPoint<u8>, _: &Observer<u8>| {
            panic!("delivered after stop");
        })
        .unwrap();
        point.attach(&observer, point.version());
        point.write(1, LockRequest::NoRequest);
        let dispatcher = event_loop.dispatcher().clone();
        assert_eq!(dispatcher.pending_len(), 1);

        event_loop.notifier().please_stop();
        event_loop.run(&mut ());
        assert_eq!(dispatcher.pending_len(), 0);
        drop(observer);
        assert_eq!(dispatcher.observer_count(), 0);
    }

    #[test]
    fn spawned_loop_runs_hooks_and_stops_on_join() {
        let event_loop = new_loop();
        let state = Arc::new(Mutex::new(Recorder::default()));

        struct SharedRecorder(Arc<Mutex<Recorder>>);
        impl LoopHandler for SharedRecorder {
            fn start(&mut self, ctx: &mut LoopContext<'_>) {
                self.0.lock().unwrap().start(ctx);
            }
            fn event_flag(&mut self, flag: u8, ctx: &mut LoopContext<'_>) {
                self.0.lock().unwrap().event_flag(flag, ctx);
                if flag == 3 {
                    ctx.please_stop();
                }
            }
            fn stop(&mut self, ctx: &mut LoopContext<'_>) {
                self.0.lock().unwrap().stop(ctx);
            }
        }

        let handle = event_loop.spawn(SharedRecorder(Arc::clone(&state))).unwrap();
        handle.notify(3);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !state.lock().unwrap().stopped && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        handle.join().unwrap();
        let state = state.lock().unwrap();
        assert!(state.started);
        assert!(state.stopped);
        assert_eq!(state.flags, vec![3]);
    }
}
