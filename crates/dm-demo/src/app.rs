#![forbid(unsafe_code)]

//! The demo pipeline.
//!
//! ```text
//!  dm-sensor thread ──write──▶ indoor_temp ──▶ dm-control loop ──▶ mode, status
//!          └─────────rmw───▶ metrics
//!  every point ──▶ dm-journal loop ──▶ JSONL
//! ```
//!
//! The sensor thread writes as fast as `--interval-ms` allows; the control
//! loop sees a coalesced stream and always ends on the last sample. Locking
//! `thermostat.mode` with `--set` freezes the control loop's output.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use dm_core::{
    Dispatcher, DispatcherConfig, GenericObserver, LockRequest, ModelPoint, Observer, PointRef, Registry,
    RmwOutcome, SubscribeError, TextError,
};
use dm_runtime::{ChangeJournal, EventLoop, EventLoopConfig, EventLoopHandle};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cli::Opts;
use crate::model::{HvacMode, Metrics, Status, Thermostat, sensor_sample};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure running the pipeline.
#[derive(Debug)]
pub enum AppError {
    Io(io::Error),
    Subscribe(SubscribeError),
    /// A `--set` update was rejected.
    Update(TextError),
    /// A pipeline thread panicked.
    ThreadPanicked(&'static str),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Subscribe(e) => write!(f, "subscribe failed: {e}"),
            Self::Update(e) => write!(f, "update rejected: {e}"),
            Self::ThreadPanicked(name) => write!(f, "{name} thread panicked"),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Subscribe(e) => Some(e),
            Self::Update(e) => Some(e),
            Self::ThreadPanicked(_) => None,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<SubscribeError> for AppError {
    fn from(e: SubscribeError) -> Self {
        Self::Subscribe(e)
    }
}

impl From<TextError> for AppError {
    fn from(e: TextError) -> Self {
        Self::Update(e)
    }
}

/// What a run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Samples the sensor thread wrote.
    pub samples_written: u32,
    /// Text form of every point, in name order, after the run.
    pub points: Vec<Value>,
    /// Lines written to the journal, zero when disabled.
    pub journal_lines: u64,
    /// False when the subscribers had not caught up within the settle
    /// timeout.
    pub settled: bool,
}

/// Text form of every point in name order.
#[must_use]
pub fn dump(registry: &Registry) -> Vec<Value> {
    registry
        .points_by_name()
        .iter()
        .map(PointRef::to_json_value)
        .collect()
}

/// Apply `--set` updates in order.
pub fn apply_updates(registry: &Registry, updates: &[String]) -> Result<(), AppError> {
    for update in updates {
        let (point, version) = registry.apply_json(update)?;
        info!(point = %point.name(), %version, "dm.demo.set");
    }
    Ok(())
}

/// Control observer on `indoor_temp`: picks the HVAC mode for each delivered
/// sample. `handled` receives the temperature version once the mode and
/// status writes for it are done.
fn control_observer(
    dispatcher: &Dispatcher,
    model: &Thermostat,
    deadband: f32,
    handled: Arc<AtomicU16>,
) -> Result<Observer<f32>, SubscribeError> {
    let model = model.clone();
    Observer::new(dispatcher, move |temp: &ModelPoint<f32>, observer: &Observer<f32>| {
        let reading = temp.read_and_sync(observer);
        if let Some(sample) = reading.value {
            let setpoint = model.setpoint.read().value.unwrap_or(sample);
            let mode = HvacMode::decide(sample, setpoint, deadband);
            model.mode.write(mode, LockRequest::NoRequest);
            model
                .status
                .write(Status::new(&format!("{mode} at {sample:.1}")), LockRequest::NoRequest);
            debug!(sample, setpoint, %mode, "dm.demo.control");
        }
        handled.store(reading.version.get(), Ordering::Release);
    })
}

fn spawn_loop(name: &str) -> io::Result<EventLoopHandle> {
    EventLoop::new(
        EventLoopConfig::default().with_name(name),
        DispatcherConfig::default().with_name(name),
    )
    .spawn(())
}

fn spawn_sensor(model: &Thermostat, samples: u32, interval: Duration) -> io::Result<thread::JoinHandle<u32>> {
    let model = model.clone();
    thread::Builder::new()
        .name("dm-sensor".into())
        .spawn(move || {
            for n in 0..samples {
                let sample = sensor_sample(n);
                model.indoor_temp.write(sample, LockRequest::NoRequest);
                model
                    .metrics
                    .read_modify_write(LockRequest::NoRequest, |metrics: &mut Metrics, valid| {
                        if !valid {
                            *metrics = Metrics::default();
                        }
                        metrics.record(sample);
                        RmwOutcome::Changed
                    });
                if !interval.is_zero() {
                    thread::sleep(interval);
                }
            }
            samples
        })
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Run the pipeline described by `opts`.
pub fn run(opts: &Opts) -> Result<RunSummary, AppError> {
    let registry = Registry::new();
    let model = Thermostat::register(&registry, opts.setpoint);
    apply_updates(&registry, &opts.set)?;
    if opts.dump_only {
        return Ok(RunSummary {
            samples_written: 0,
            points: dump(&registry),
            journal_lines: 0,
            settled: true,
        });
    }

    let journal = ChangeJournal::from_config(&opts.journal_config())?;
    let journal_loop = match &journal {
        Some(_) => Some(spawn_loop("dm-journal")?),
        None => None,
    };
    let mut journal_observers: Vec<(PointRef, GenericObserver)> = Vec::new();
    if let (Some(journal), Some(handle)) = (&journal, &journal_loop) {
        for point in registry.points_by_name() {
            let observer = journal.observe(handle.dispatcher(), &point)?;
            journal_observers.push((point, observer));
        }
    }

    let control = spawn_loop("dm-control")?;
    let handled = Arc::new(AtomicU16::new(model.indoor_temp.version().get()));
    let controller = control_observer(
        control.dispatcher(),
        &model,
        opts.deadband,
        Arc::clone(&handled),
    )?;
    model
        .indoor_temp
        .attach(&controller, model.indoor_temp.version());

    info!(samples = opts.samples, interval_ms = opts.interval_ms, "dm.demo.start");
    let samples_written = spawn_sensor(&model, opts.samples, opts.interval())?
        .join()
        .map_err(|_| AppError::ThreadPanicked("dm-sensor"))?;

    let settled = wait_until(SETTLE_TIMEOUT, || {
        handled.load(Ordering::Acquire) == model.indoor_temp.version().get()
            && journal_observers
                .iter()
                .all(|(point, observer)| observer.last_seen() == point.version())
    });
    if !settled {
        warn!(timeout_ms = SETTLE_TIMEOUT.as_millis() as u64, "dm.demo.unsettled");
    }

    control
        .join()
        .map_err(|_| AppError::ThreadPanicked("dm-control"))?;
    if let Some(handle) = journal_loop {
        handle
            .join()
            .map_err(|_| AppError::ThreadPanicked("dm-journal"))?;
    }
    let journal_lines = match &journal {
        Some(journal) => {
            journal.flush()?;
            journal.lines_written()
        }
        None => 0,
    };

    info!(samples_written, journal_lines, settled, "dm.demo.done");
    Ok(RunSummary {
        samples_written,
        points: dump(&registry),
        journal_lines,
        settled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_core::Version;

    #[test]
    fn dump_is_name_ordered() {
        let registry = Registry::new();
        let _model = Thermostat::register(&registry, 20.0);
        let names: Vec<_> = dump(&registry)
            .iter()
            .map(|p| p["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, registry.names_by_name());
    }

    #[test]
    fn bad_update_reports_point() {
        let registry = Registry::new();
        let _model = Thermostat::register(&registry, 20.0);
        let err = apply_updates(&registry, &[r#"{"name":"nope","val":1}"#.to_string()]).unwrap_err();
        assert!(matches!(err, AppError::Update(TextError::UnknownPoint(ref n)) if n == "nope"));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn control_observer_tracks_setpoint() {
        let registry = Registry::new();
        let model = Thermostat::register(&registry, 21.0);
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        let handled = Arc::new(AtomicU16::new(0));
        let observer = control_observer(&dispatcher, &model, 0.5, Arc::clone(&handled)).unwrap();
        model.indoor_temp.attach(&observer, Version::UNKNOWN);

        let version = model.indoor_temp.write(18.0, LockRequest::NoRequest);
        dispatcher.dispatch_all();
        assert_eq!(model.mode.read().value, Some(HvacMode::Heat));
        assert_eq!(model.status.read().value.unwrap().as_str(), "heat at 18.0");
        assert_eq!(handled.load(Ordering::Acquire), version.get());

        model.setpoint.write(15.0, LockRequest::NoRequest);
        model.indoor_temp.write(18.2, LockRequest::NoRequest);
        dispatcher.dispatch_all();
        assert_eq!(model.mode.read().value, Some(HvacMode::Cool));
    }

    #[test]
    fn control_skips_invalid_temperature() {
        let registry = Registry::new();
        let model = Thermostat::register(&registry, 21.0);
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        let handled = Arc::new(AtomicU16::new(0));
        let observer = control_observer(&dispatcher, &model, 0.5, Arc::clone(&handled)).unwrap();
        let mode_version = model.mode.version();
        model.indoor_temp.attach(&observer, Version::UNKNOWN);
        dispatcher.dispatch_all();
        assert_eq!(model.mode.version(), mode_version);
        assert_eq!(handled.load(Ordering::Acquire), model.indoor_temp.version().get());
    }
}
