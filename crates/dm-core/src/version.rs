#![forbid(unsafe_code)]

//! Sequence numbers and lock requests shared by every point operation.

use serde::{Deserialize, Serialize};

/// 16-bit wrapping change counter of a model point.
///
/// `0` is reserved for [`Version::UNKNOWN`]; a point never holds it. New
/// points start at 1 and wrapping past `u16::MAX` lands on 1 again.
/// Versions are compared for equality only since they wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u16);

impl Version {
    /// "I do not know the point's version." Attaching with this value always
    /// produces an immediate notification.
    pub const UNKNOWN: Self = Self(0);

    /// Version of a freshly constructed point.
    pub(crate) const INITIAL: Self = Self(1);

    /// Wrap a raw sequence number.
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw sequence number.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// True for [`Version::UNKNOWN`].
    #[must_use]
    pub const fn is_unknown(self) -> bool {
        self.0 == 0
    }

    /// The following version, skipping the reserved zero on wrap.
    #[must_use]
    pub const fn next(self) -> Self {
        let n = self.0.wrapping_add(1);
        if n == 0 { Self(1) } else { Self(n) }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock handling requested alongside a mutation.
///
/// A locked point silently drops every mutation made with
/// [`LockRequest::NoRequest`]. `Lock` and `Unlock` always apply the
/// mutation and then leave the point in the requested lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockRequest {
    /// Leave the lock state alone; fail silently if locked.
    #[default]
    NoRequest,
    /// Apply the mutation and lock the point.
    Lock,
    /// Unlock the point and apply the mutation.
    Unlock,
}

impl LockRequest {
    /// Map an optional `locked` flag (as found in the text form).
    #[must_use]
    pub fn from_flag(locked: Option<bool>) -> Self {
        match locked {
            Some(true) => Self::Lock,
            Some(false) => Self::Unlock,
            None => Self::NoRequest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_skips_unknown_on_wrap() {
        assert_eq!(Version::from_raw(u16::MAX).next(), Version::from_raw(1));
        assert_eq!(Version::INITIAL.next(), Version::from_raw(2));
    }

    #[test]
    fn unknown_is_zero() {
        assert!(Version::UNKNOWN.is_unknown());
        assert!(!Version::INITIAL.is_unknown());
        assert_eq!(Version::UNKNOWN.get(), 0);
    }

    #[test]
    fn serializes_as_plain_number() {
        let json = serde_json::to_string(&Version::from_raw(42)).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn lock_request_from_flag() {
        assert_eq!(LockRequest::from_flag(None), LockRequest::NoRequest);
        assert_eq!(LockRequest::from_flag(Some(true)), LockRequest::Lock);
        assert_eq!(LockRequest::from_flag(Some(false)), LockRequest::Unlock);
    }
}
