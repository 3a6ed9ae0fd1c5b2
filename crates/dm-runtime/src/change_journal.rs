#![forbid(unsafe_code)]

//! JSONL journal of observed model point changes.
//!
//! A shared, line-oriented sink. Each observed change becomes one line:
//!
//! ```json
//! {"seq":12,"point":{"name":"temp","type":"f32","valid":true,"seqnum":7,"locked":false,"val":21.5}}
//! ```
//!
//! `seq` counts lines written by this journal. Writes are serialized behind a
//! mutex, so line order is the order of `record` calls; flushing is explicit
//! and configurable.

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dm_core::{Dispatcher, GenericObserver, PointRef, SubscribeError, Version};
use serde_json::json;
use tracing::warn;

/// Destination for journal lines.
#[derive(Debug, Clone)]
pub enum JournalDestination {
    Stdout,
    /// Append to a file at the given path.
    File(PathBuf),
}

impl JournalDestination {
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }
}

/// Journal configuration.
#[derive(Debug, Clone)]
pub struct ChangeJournalConfig {
    pub enabled: bool,
    pub destination: JournalDestination,
    /// Flush after every line.
    pub flush_on_write: bool,
}

impl Default for ChangeJournalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            destination: JournalDestination::Stdout,
            flush_on_write: true,
        }
    }
}

impl ChangeJournalConfig {
    /// Disabled journal.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn enabled_stdout() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn enabled_file(path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            destination: JournalDestination::file(path),
            flush_on_write: true,
        }
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_destination(mut self, destination: JournalDestination) -> Self {
        self.destination = destination;
        self
    }

    #[must_use]
    pub fn with_flush_on_write(mut self, enabled: bool) -> Self {
        self.flush_on_write = enabled;
        self
    }
}

struct JournalInner {
    writer: BufWriter<Box<dyn Write + Send>>,
    flush_on_write: bool,
    seq: u64,
}

/// Shared JSONL change journal.
#[derive(Clone)]
pub struct ChangeJournal {
    inner: Arc<Mutex<JournalInner>>,
}

impl std::fmt::Debug for ChangeJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeJournal")
            .field("lines", &self.lines_written())
            .finish()
    }
}

impl ChangeJournal {
    /// Build a journal from config. Returns `Ok(None)` when disabled.
    pub fn from_config(config: &ChangeJournalConfig) -> io::Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let writer: Box<dyn Write + Send> = match &config.destination {
            JournalDestination::Stdout => Box::new(io::stdout()),
            JournalDestination::File(path) => {
                Box::new(OpenOptions::new().create(true).append(true).open(path)?)
            }
        };
        Ok(Some(Self::from_writer(writer, config.flush_on_write)))
    }

    /// Journal onto an arbitrary writer.
    pub fn from_writer(writer: Box<dyn Write + Send>, flush_on_write: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(JournalInner {
                writer: BufWriter::new(writer),
                flush_on_write,
                seq: 0,
            })),
        }
    }

    /// Append the current text form of `point`. Returns the line's `seq`.
    pub fn record(&self, point: &PointRef) -> io::Result<u64> {
        self.write_point(point.to_json_value())
    }

    fn write_point(&self, point: serde_json::Value) -> io::Result<u64> {
        let mut inner = self.inner.lock().expect("change journal lock poisoned");
        inner.seq += 1;
        let line = json!({ "seq": inner.seq, "point": point }).to_string();
        inner.writer.write_all(line.as_bytes())?;
        inner.writer.write_all(b"\n")?;
        if inner.flush_on_write {
            inner.writer.flush()?;
        }
        Ok(inner.seq)
    }

    /// Number of lines written so far.
    #[must_use]
    pub fn lines_written(&self) -> u64 {
        self.inner.lock().expect("change journal lock poisoned").seq
    }

    pub fn flush(&self) -> io::Result<()> {
        self.inner
            .lock()
            .expect("change journal lock poisoned")
            .writer
            .flush()
    }

    /// Journal every change of `point`, delivered on `dispatcher`.
    ///
    /// The observer attaches with [`Version::UNKNOWN`], so the point's current
    /// state is journaled first. Write failures are logged and dropped.
    pub fn observe(&self, dispatcher: &Dispatcher, point: &PointRef) -> Result<GenericObserver, SubscribeError> {
        let journal = self.clone();
        let observer = GenericObserver::new(dispatcher, move |point: &PointRef, observer: &GenericObserver| {
            if let Err(err) = journal.write_point(point.to_json_value_and_sync(observer)) {
                warn!(point = %point.name(), error = %err, "change journal write failed");
            }
        })?;
        point.attach(&observer, Version::UNKNOWN);
        Ok(observer)
    }
}
