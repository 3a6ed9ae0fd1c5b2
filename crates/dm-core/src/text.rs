#![forbid(unsafe_code)]

//! JSON text form of a model point.
//!
//! Outbound:
//!
//! ```json
//! {"name": "...", "type": "...", "valid": true, "seqnum": 7, "locked": false, "val": ...}
//! ```
//!
//! `val` is omitted while the point is invalid.
//!
//! Inbound (merge) accepts the same object; every key is optional except
//! that at least one of `val`, `valid: false`, or `locked` must be present.
//! Unknown keys are ignored.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::version::{LockRequest, Version};

/// Error parsing or applying the text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextError {
    /// Input is not a JSON object.
    Malformed(String),
    /// Registry-level input without a `"name"` key.
    MissingName,
    /// No point with the given name.
    UnknownPoint(String),
    /// None of `val`, `valid: false`, `locked` present.
    NoAction,
    /// `val` does not decode into the point's type.
    InvalidValue(String),
    /// Partial array update outside the array bounds.
    OutOfRange { start: usize, count: usize, len: usize },
}

impl fmt::Display for TextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed point text: {msg}"),
            Self::MissingName => write!(f, "missing \"name\""),
            Self::UnknownPoint(name) => write!(f, "unknown point: {name}"),
            Self::NoAction => write!(f, "nothing to apply: expected \"val\", \"valid\", or \"locked\""),
            Self::InvalidValue(msg) => write!(f, "invalid \"val\": {msg}"),
            Self::OutOfRange { start, count, len } => {
                write!(
                    f,
                    "elements {start}..{} out of range for length {len}",
                    start.saturating_add(*count)
                )
            }
        }
    }
}

impl std::error::Error for TextError {}

/// Outbound text form.
#[derive(Debug, Serialize)]
pub(crate) struct PointText<'a> {
    pub name: &'a str,
    #[serde(rename = "type")]
    pub type_name: String,
    pub valid: bool,
    pub seqnum: Version,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val: Option<Value>,
}

/// Inbound text form.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct MergeRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub valid: Option<bool>,
    #[serde(default)]
    pub locked: Option<bool>,
    #[serde(default)]
    pub val: Option<Value>,
}

/// What a merge request asks the point to do.
#[derive(Debug)]
pub(crate) enum MergeAction {
    Invalidate,
    Merge(Value),
    SetLock,
}

impl MergeRequest {
    pub(crate) fn parse(text: &str) -> Result<Self, TextError> {
        serde_json::from_str(text).map_err(|e| TextError::Malformed(e.to_string()))
    }

    pub(crate) fn lock_request(&self) -> LockRequest {
        LockRequest::from_flag(self.locked)
    }

    /// `valid: false` wins over `val`; a bare `locked` only changes the lock.
    pub(crate) fn action(&self) -> Result<MergeAction, TextError> {
        if self.valid == Some(false) {
            Ok(MergeAction::Invalidate)
        } else if let Some(val) = &self.val {
            Ok(MergeAction::Merge(val.clone()))
        } else if self.locked.is_some() {
            Ok(MergeAction::SetLock)
        } else {
            Err(TextError::NoAction)
        }
    }
}
