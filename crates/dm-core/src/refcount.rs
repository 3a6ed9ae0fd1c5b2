#![forbid(unsafe_code)]

//! Saturating reference counter.
//!
//! # Design
//!
//! [`RefCount`] is a `u32` that clamps at `0` and `u32::MAX` instead of
//! wrapping. Only edges advance the version: invalid to valid, zero to
//! non-zero, and non-zero to zero. Any other count change is stored without
//! a notification, so observers wake when something becomes "in use" or
//! "idle" and never for the traffic in between.
//!
//! The text form carries the count as a string. A merge `"val"` of `"+n"`
//! increments, `"-n"` decrements, and `"n"` (or a plain JSON number) resets.
//!
//! # Invariants
//!
//! 1. Invalidating a counter zeroes it, so the next increment counts from 0.
//! 2. Increments and decrements never wrap.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::point::{ModelPoint, RmwOutcome};
use crate::text::TextError;
use crate::value::{CodecError, FixedCodec, PointValue};
use crate::version::{LockRequest, Version};

/// Saturating `u32` counter value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefCount(u32);

impl RefCount {
    #[must_use]
    pub const fn new(count: u32) -> Self {
        Self(count)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for RefCount {
    fn from(count: u32) -> Self {
        Self(count)
    }
}

impl fmt::Display for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for RefCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CountRepr {
    Number(u32),
    Text(String),
}

impl<'de> Deserialize<'de> for RefCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match CountRepr::deserialize(deserializer)? {
            CountRepr::Number(n) => Ok(Self(n)),
            CountRepr::Text(text) => parse_count(&text).map(Self).map_err(D::Error::custom),
        }
    }
}

fn parse_count(text: &str) -> Result<u32, String> {
    text.trim()
        .parse::<u32>()
        .map_err(|e| format!("bad count {text:?}: {e}"))
}

impl FixedCodec for RefCount {
    const SIZE: usize = 4;

    fn encode(&self, out: &mut [u8]) {
        self.0.encode(out);
    }

    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        u32::decode(src).map(Self)
    }
}

impl PointValue for RefCount {
    fn type_name() -> String {
        "RefCount".to_string()
    }

    fn changes_from(&self, previous: &Self) -> bool {
        self.is_zero() != previous.is_zero()
    }

    fn on_invalidate(&mut self) {
        self.0 = 0;
    }

    fn merge_json(&mut self, patch: &Value) -> Result<(), TextError> {
        let next = match patch {
            Value::String(text) => {
                if let Some(n) = text.strip_prefix('+') {
                    self.0.saturating_add(parse_count(n).map_err(TextError::InvalidValue)?)
                } else if let Some(n) = text.strip_prefix('-') {
                    self.0.saturating_sub(parse_count(n).map_err(TextError::InvalidValue)?)
                } else {
                    parse_count(text).map_err(TextError::InvalidValue)?
                }
            }
            Value::Number(_) => serde_json::from_value(patch.clone())
                .map_err(|e| TextError::InvalidValue(e.to_string()))?,
            other => {
                return Err(TextError::InvalidValue(format!(
                    "expected count string, got {other}"
                )));
            }
        };
        self.0 = next;
        Ok(())
    }
}

impl ModelPoint<RefCount> {
    /// Add `n`, clamping at `u32::MAX`.
    pub fn increment(&self, n: u32, lock: LockRequest) -> Version {
        self.adjust(lock, |count| count.saturating_add(n))
    }

    /// Subtract `n`, clamping at 0.
    pub fn decrement(&self, n: u32, lock: LockRequest) -> Version {
        self.adjust(lock, |count| count.saturating_sub(n))
    }

    /// Set the count to `n`.
    pub fn reset(&self, n: u32, lock: LockRequest) -> Version {
        self.adjust(lock, |_| n)
    }

    fn adjust(&self, lock: LockRequest, op: impl FnOnce(u32) -> u32) -> Version {
        self.read_modify_write(lock, |count, valid| {
            let previous = *count;
            *count = RefCount(op(previous.0));
            if !valid || count.changes_from(&previous) {
                RmwOutcome::Changed
            } else {
                RmwOutcome::NoChange
            }
        })
    }
}
