#![forbid(unsafe_code)]

//! Thermostat model: the points the demo pipeline shares between threads.
//!
//! | Point                      | Shape         | Writer            |
//! |----------------------------|---------------|-------------------|
//! | `thermostat.indoor_temp`   | `f32`         | sensor thread     |
//! | `thermostat.metrics`       | [`Metrics`]   | sensor thread     |
//! | `thermostat.setpoint`      | `f32`         | `--set` / startup |
//! | `thermostat.mode`          | [`HvacMode`]  | control loop      |
//! | `thermostat.status`        | [`Status`]    | control loop      |

use std::fmt;

use dm_core::{BoundedString, CodecError, FixedCodec, ModelPoint, PointValue, Registry};
use serde::{Deserialize, Serialize};

pub const INDOOR_TEMP: &str = "thermostat.indoor_temp";
pub const SETPOINT: &str = "thermostat.setpoint";
pub const MODE: &str = "thermostat.mode";
pub const METRICS: &str = "thermostat.metrics";
pub const STATUS: &str = "thermostat.status";

/// Status line, at most 32 bytes.
pub type Status = BoundedString<32>;

/// What the HVAC unit is doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacMode {
    #[default]
    Off,
    Heat,
    Cool,
}

impl HvacMode {
    /// Mode that drives `temp` toward `setpoint`. Within `deadband` of the
    /// setpoint the unit stays off.
    #[must_use]
    pub fn decide(temp: f32, setpoint: f32, deadband: f32) -> Self {
        if temp < setpoint - deadband {
            Self::Heat
        } else if temp > setpoint + deadband {
            Self::Cool
        } else {
            Self::Off
        }
    }

    const fn code(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Heat => 1,
            Self::Cool => 2,
        }
    }
}

impl fmt::Display for HvacMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Heat => "heat",
            Self::Cool => "cool",
        })
    }
}

impl FixedCodec for HvacMode {
    const SIZE: usize = 1;

    fn encode(&self, out: &mut [u8]) {
        out[0] = self.code();
    }

    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        match src {
            [0] => Ok(Self::Off),
            [1] => Ok(Self::Heat),
            [2] => Ok(Self::Cool),
            [code] => Err(CodecError::InvalidValue(format!("hvac mode code {code}"))),
            _ => Err(CodecError::SizeMismatch {
                expected: Self::SIZE,
                actual: src.len(),
            }),
        }
    }
}

impl PointValue for HvacMode {
    fn type_name() -> String {
        "HvacMode".to_string()
    }
}

/// Running statistics over temperature samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub num_samples: u32,
    pub sum_total: f64,
    pub min: f32,
    pub max: f32,
}

impl Metrics {
    pub fn record(&mut self, sample: f32) {
        if self.num_samples == 0 {
            self.min = sample;
            self.max = sample;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        self.num_samples = self.num_samples.saturating_add(1);
        self.sum_total += f64::from(sample);
    }

    #[must_use]
    pub fn mean(&self) -> Option<f64> {
        (self.num_samples > 0).then(|| self.sum_total / f64::from(self.num_samples))
    }
}

impl FixedCodec for Metrics {
    const SIZE: usize = 20;

    fn encode(&self, out: &mut [u8]) {
        self.num_samples.encode(&mut out[0..4]);
        self.sum_total.encode(&mut out[4..12]);
        self.min.encode(&mut out[12..16]);
        self.max.encode(&mut out[16..20]);
    }

    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        if src.len() != Self::SIZE {
            return Err(CodecError::SizeMismatch {
                expected: Self::SIZE,
                actual: src.len(),
            });
        }
        Ok(Self {
            num_samples: u32::decode(&src[0..4])?,
            sum_total: f64::decode(&src[4..12])?,
            min: f32::decode(&src[12..16])?,
            max: f32::decode(&src[16..20])?,
        })
    }
}

impl PointValue for Metrics {
    fn type_name() -> String {
        "Metrics".to_string()
    }
}

/// Handles to every thermostat point.
#[derive(Debug, Clone)]
pub struct Thermostat {
    pub indoor_temp: ModelPoint<f32>,
    pub setpoint: ModelPoint<f32>,
    pub mode: ModelPoint<HvacMode>,
    pub metrics: ModelPoint<Metrics>,
    pub status: ModelPoint<Status>,
}

impl Thermostat {
    /// Register the thermostat points. Temperature and metrics start
    /// invalid until the first sample arrives.
    pub fn register(registry: &Registry, setpoint: f32) -> Self {
        Self {
            indoor_temp: ModelPoint::new(registry, INDOOR_TEMP),
            setpoint: ModelPoint::with_value(registry, SETPOINT, setpoint),
            mode: ModelPoint::with_value(registry, MODE, HvacMode::Off),
            metrics: ModelPoint::new(registry, METRICS),
            status: ModelPoint::with_value(registry, STATUS, Status::new("idle")),
        }
    }
}

/// Deterministic sensor reading number `n`: a slow swing around 21 degrees.
#[must_use]
pub fn sensor_sample(n: u32) -> f32 {
    21.0 + 3.0 * (n as f32 * 0.35).sin()
}
