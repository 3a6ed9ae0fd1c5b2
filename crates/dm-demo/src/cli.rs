#![forbid(unsafe_code)]

//! Command-line argument parsing for the thermostat demo.
//!
//! Parses args manually to keep the binary lean. Supports environment
//! variable overrides via the `DM_DEMO_*` prefix.

use std::env;
use std::process;
use std::time::Duration;

use dm_runtime::{ChangeJournalConfig, JournalDestination, LogConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const HELP_TEXT: &str = "\
dm-demo: thermostat pipeline over shared model points

USAGE:
    dm-demo [OPTIONS]

OPTIONS:
    --samples=N          Sensor samples to write (default: 40)
    --interval-ms=N      Delay between samples in ms (default: 5)
    --setpoint=F         Initial setpoint in degrees (default: 21.0)
    --deadband=F         Half-width of the idle band (default: 0.5)
    --journal=PATH       Journal every change as JSONL ('-' for stdout)
    --set=JSON           Apply a text-form update before the run, e.g.
                         {\"name\":\"thermostat.mode\",\"locked\":true,\"val\":\"cool\"}
                         May be repeated.
    --dump-only          Print the points after --set updates and exit
    --log=FILTER         Log filter, RUST_LOG syntax (default: info)
    --json-logs          Emit logs as JSON lines
    --help, -h           Show this help message
    --version, -V        Show version

POINTS:
    thermostat.indoor_temp   f32       latest sensor reading
    thermostat.metrics       Metrics   numSamples, sumTotal, min, max
    thermostat.mode          HvacMode  off | heat | cool
    thermostat.setpoint      f32       target temperature
    thermostat.status        string    short status line

ENVIRONMENT VARIABLES:
    DM_DEMO_SAMPLES       Override --samples
    DM_DEMO_INTERVAL_MS   Override --interval-ms
    DM_DEMO_SETPOINT      Override --setpoint
    DM_DEMO_JOURNAL       Override --journal
    DM_DEMO_LOG           Override --log
    DM_DEMO_JSON_LOGS     Override --json-logs (1/true to enable)";

/// Parsed command-line options.
#[derive(Debug, Clone, PartialEq)]
pub struct Opts {
    /// Number of sensor samples the writer thread produces.
    pub samples: u32,
    /// Delay between samples in milliseconds.
    pub interval_ms: u64,
    pub setpoint: f32,
    pub deadband: f32,
    /// Journal destination: `-` for stdout, otherwise a file path.
    pub journal: Option<String>,
    /// Text-form updates applied in order before the run.
    pub set: Vec<String>,
    pub dump_only: bool,
    /// `RUST_LOG`-style filter.
    pub log: String,
    pub json_logs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseError {
    Help,
    Version,
    InvalidValue { flag: &'static str, value: String },
    UnknownArg(String),
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            samples: 40,
            interval_ms: 5,
            setpoint: 21.0,
            deadband: 0.5,
            journal: None,
            set: Vec::new(),
            dump_only: false,
            log: "info".into(),
            json_logs: false,
        }
    }
}

impl Opts {
    /// Parse command-line arguments and environment variables.
    ///
    /// Environment variables take precedence over defaults but are overridden
    /// by explicit command-line flags.
    pub fn parse() -> Self {
        match Self::parse_from_env_and_args(env::args().skip(1), |key| env::var(key).ok()) {
            Ok(opts) => opts,
            Err(ParseError::Help) => {
                println!("{HELP_TEXT}");
                process::exit(0);
            }
            Err(ParseError::Version) => {
                println!("dm-demo {VERSION}");
                process::exit(0);
            }
            Err(ParseError::InvalidValue { flag, value }) => {
                eprintln!("Invalid {flag} value: {value}");
                process::exit(1);
            }
            Err(ParseError::UnknownArg(arg)) => {
                eprintln!("Unknown argument: {arg}");
                eprintln!("Run with --help for usage information.");
                process::exit(1);
            }
        }
    }

    fn parse_from_env_and_args<I, S, F>(args: I, get_env: F) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&str) -> Option<String>,
    {
        let mut opts = Self::default();

        // Apply environment variable defaults first
        if let Some(val) = get_env("DM_DEMO_SAMPLES")
            && let Ok(n) = val.parse()
        {
            opts.samples = n;
        }
        if let Some(val) = get_env("DM_DEMO_INTERVAL_MS")
            && let Ok(n) = val.parse()
        {
            opts.interval_ms = n;
        }
        if let Some(val) = get_env("DM_DEMO_SETPOINT")
            && let Ok(n) = val.parse()
        {
            opts.setpoint = n;
        }
        if let Some(val) = get_env("DM_DEMO_JOURNAL")
            && !val.trim().is_empty()
        {
            opts.journal = Some(val);
        }
        if let Some(val) = get_env("DM_DEMO_LOG")
            && !val.trim().is_empty()
        {
            opts.log = val;
        }
        if let Some(val) = get_env("DM_DEMO_JSON_LOGS") {
            opts.json_logs = val == "1" || val.eq_ignore_ascii_case("true");
        }

        // Parse command-line args (override env vars)
        for arg in args {
            match arg.as_ref() {
                "--help" | "-h" => return Err(ParseError::Help),
                "--version" | "-V" => return Err(ParseError::Version),
                "--dump-only" => opts.dump_only = true,
                "--json-logs" => opts.json_logs = true,
                other => {
                    if let Some(val) = other.strip_prefix("--samples=") {
                        opts.samples = parse_value("--samples", val)?;
                    } else if let Some(val) = other.strip_prefix("--interval-ms=") {
                        opts.interval_ms = parse_value("--interval-ms", val)?;
                    } else if let Some(val) = other.strip_prefix("--setpoint=") {
                        opts.setpoint = parse_value("--setpoint", val)?;
                    } else if let Some(val) = other.strip_prefix("--deadband=") {
                        let deadband: f32 = parse_value("--deadband", val)?;
                        if deadband.is_nan() || deadband < 0.0 {
                            return Err(ParseError::InvalidValue {
                                flag: "--deadband",
                                value: val.to_string(),
                            });
                        }
                        opts.deadband = deadband;
                    } else if let Some(val) = other.strip_prefix("--journal=") {
                        if !val.trim().is_empty() {
                            opts.journal = Some(val.to_string());
                        }
                    } else if let Some(val) = other.strip_prefix("--set=") {
                        opts.set.push(val.to_string());
                    } else if let Some(val) = other.strip_prefix("--log=") {
                        opts.log = val.to_string();
                    } else {
                        return Err(ParseError::UnknownArg(other.to_string()));
                    }
                }
            }
        }

        Ok(opts)
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Journal configuration for `--journal`; disabled when unset.
    #[must_use]
    pub fn journal_config(&self) -> ChangeJournalConfig {
        match self.journal.as_deref() {
            None => ChangeJournalConfig::disabled(),
            Some("-") => ChangeJournalConfig::enabled_stdout(),
            Some(path) => ChangeJournalConfig::enabled_file(path),
        }
    }

    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig::default()
            .with_filter(self.log.clone())
            .with_json(self.json_logs)
    }

    /// True when journal lines go to stdout.
    #[must_use]
    pub fn journal_on_stdout(&self) -> bool {
        matches!(
            self.journal_config().destination,
            JournalDestination::Stdout
        ) && self.journal.is_some()
    }
}

fn parse_value<T: std::str::FromStr>(flag: &'static str, val: &str) -> Result<T, ParseError> {
    val.parse().map_err(|_| ParseError::InvalidValue {
        flag,
        value: val.to_string(),
    })
}
