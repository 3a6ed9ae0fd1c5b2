#![forbid(unsafe_code)]

//! Value shapes a model point can hold.
//!
//! # Design
//!
//! A point's datum implements [`PointValue`], which bundles two codecs:
//!
//! - **text**: `serde` with a recursive partial merge ([`PointValue::merge_json`]);
//! - **binary**: [`FixedCodec`], a fixed-width little-endian layout so a
//!   point's exported blob always has the same length.
//!
//! Built-in shapes: `bool`, all fixed-width integers, `f32`, `f64`,
//! `[T; N]` for `N <= 32`, and [`BoundedString<N>`]. Applications implement
//! both traits for their own structs and enums.
//!
//! # Invariants
//!
//! 1. `encode` writes exactly `SIZE` bytes; `decode` rejects any other length.
//! 2. A failed `merge_json` leaves `self` untouched.
//! 3. `Default` is the buffer content of a point that has never been valid.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Not};

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::text::TextError;

/// Error decoding a fixed-width binary value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input length differs from the codec's fixed size.
    SizeMismatch { expected: usize, actual: usize },
    /// Bytes have the right length but do not form a valid value.
    InvalidValue(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch: expected {expected} bytes, got {actual}")
            }
            Self::InvalidValue(msg) => write!(f, "invalid value: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Fixed-width binary layout of a value.
pub trait FixedCodec: Sized {
    /// Encoded width in bytes.
    const SIZE: usize;

    /// Write the value into `out`, which is exactly `SIZE` bytes long.
    fn encode(&self, out: &mut [u8]);

    /// Decode a value from exactly `SIZE` bytes.
    fn decode(src: &[u8]) -> Result<Self, CodecError>;
}

/// Datum held by a [`ModelPoint`](crate::ModelPoint).
///
/// Equality decides whether a write is a change. Floating point shapes
/// therefore treat a `NaN` write as always changing.
pub trait PointValue:
    FixedCodec + Clone + Default + PartialEq + Send + Serialize + DeserializeOwned + 'static
{
    /// Name reported as `"type"` in the text form.
    fn type_name() -> String;

    /// Text form of the value (the `"val"` field).
    fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Whether storing `self` over `previous` on a valid point is a change
    /// that advances the version. The buffer is replaced either way.
    fn changes_from(&self, previous: &Self) -> bool {
        self != previous
    }

    /// Adjust the buffer when the point becomes invalid.
    fn on_invalidate(&mut self) {}

    /// Merge a `"val"` patch into `self`.
    ///
    /// Object fields absent from `patch` keep their current values, at any
    /// depth. Anything else replaces the value wholesale.
    fn merge_json(&mut self, patch: &Value) -> Result<(), TextError> {
        let mut merged = self.to_json();
        merge_value(&mut merged, patch);
        *self = serde_json::from_value(merged).map_err(|e| TextError::InvalidValue(e.to_string()))?;
        Ok(())
    }
}

/// Recursive object merge: objects merge key by key, anything else replaces.
pub fn merge_value(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(dst), Value::Object(src)) => {
            for (key, value) in src {
                match dst.get_mut(key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        dst.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

/// Integer shapes: support `increment`/`decrement` (wrapping).
pub trait Integer: PointValue + Copy {
    fn wrapping_add(self, rhs: Self) -> Self;
    fn wrapping_sub(self, rhs: Self) -> Self;
}

/// Unsigned integer shapes: support bit set/clear/flip by mask.
pub trait Unsigned:
    Integer + BitOr<Output = Self> + BitAnd<Output = Self> + BitXor<Output = Self> + Not<Output = Self>
{
}

macro_rules! numeric_value {
    ($($ty:ty),* $(,)?) => {$(
        impl FixedCodec for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn encode(&self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            fn decode(src: &[u8]) -> Result<Self, CodecError> {
                let bytes: [u8; std::mem::size_of::<$ty>()] =
                    src.try_into().map_err(|_| CodecError::SizeMismatch {
                        expected: Self::SIZE,
                        actual: src.len(),
                    })?;
                Ok(<$ty>::from_le_bytes(bytes))
            }
        }

        impl PointValue for $ty {
            fn type_name() -> String {
                stringify!($ty).to_string()
            }
        }
    )*};
}

macro_rules! integer_value {
    (unsigned: $($u:ty),*; signed: $($s:ty),*) => {
        $(
            impl Integer for $u {
                fn wrapping_add(self, rhs: Self) -> Self { <$u>::wrapping_add(self, rhs) }
                fn wrapping_sub(self, rhs: Self) -> Self { <$u>::wrapping_sub(self, rhs) }
            }
            impl Unsigned for $u {}
        )*
        $(
            impl Integer for $s {
                fn wrapping_add(self, rhs: Self) -> Self { <$s>::wrapping_add(self, rhs) }
                fn wrapping_sub(self, rhs: Self) -> Self { <$s>::wrapping_sub(self, rhs) }
            }
        )*
    };
}

numeric_value!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);
integer_value!(unsigned: u8, u16, u32, u64; signed: i8, i16, i32, i64);

impl FixedCodec for bool {
    const SIZE: usize = 1;

    fn encode(&self, out: &mut [u8]) {
        out[0] = u8::from(*self);
    }

    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        match src {
            [0] => Ok(false),
            [1] => Ok(true),
            [b] => Err(CodecError::InvalidValue(format!("bool byte {b:#04x}"))),
            _ => Err(CodecError::SizeMismatch {
                expected: 1,
                actual: src.len(),
            }),
        }
    }
}

impl PointValue for bool {
    fn type_name() -> String {
        "bool".to_string()
    }
}

// Arrays: fixed element count, element layout repeated back to back.

impl<T: FixedCodec, const N: usize> FixedCodec for [T; N] {
    const SIZE: usize = T::SIZE * N;

    fn encode(&self, out: &mut [u8]) {
        for (elem, chunk) in self.iter().zip(out.chunks_exact_mut(T::SIZE.max(1))) {
            elem.encode(chunk);
        }
    }

    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        if src.len() != Self::SIZE {
            return Err(CodecError::SizeMismatch {
                expected: Self::SIZE,
                actual: src.len(),
            });
        }
        let elems = src
            .chunks_exact(T::SIZE.max(1))
            .map(T::decode)
            .collect::<Result<Vec<T>, _>>()?;
        let actual = elems.len();
        elems.try_into().map_err(|_| CodecError::SizeMismatch {
            expected: Self::SIZE,
            actual: actual * T::SIZE,
        })
    }
}

impl<T, const N: usize> PointValue for [T; N]
where
    T: PointValue,
    [T; N]: Serialize + DeserializeOwned + Default,
{
    fn type_name() -> String {
        format!("[{};{N}]", T::type_name())
    }

    /// Accepts either a full JSON array of `N` elements, or a partial update
    /// `{"start": i, "elems": [..]}` that merges into elements `i..`. A
    /// missing `"start"` means 0.
    fn merge_json(&mut self, patch: &Value) -> Result<(), TextError> {
        match patch {
            Value::Array(_) => {
                *self = serde_json::from_value(patch.clone())
                    .map_err(|e| TextError::InvalidValue(e.to_string()))?;
                Ok(())
            }
            Value::Object(map) => {
                let start = match map.get("start") {
                    None => 0,
                    Some(index) => index
                        .as_u64()
                        .ok_or_else(|| TextError::InvalidValue(format!("bad \"start\" index {index}")))?,
                };
                let elems = map
                    .get("elems")
                    .and_then(Value::as_array)
                    .ok_or_else(|| TextError::InvalidValue("missing \"elems\" array".into()))?;
                let start = usize::try_from(start).unwrap_or(usize::MAX);
                if start.checked_add(elems.len()).is_none_or(|end| end > N) {
                    return Err(TextError::OutOfRange {
                        start,
                        count: elems.len(),
                        len: N,
                    });
                }
                let mut next = self.clone();
                for (slot, patch) in next[start..].iter_mut().zip(elems) {
                    slot.merge_json(patch)?;
                }
                *self = next;
                Ok(())
            }
            other => Err(TextError::InvalidValue(format!(
                "expected array or {{start, elems}}, got {other}"
            ))),
        }
    }
}

/// UTF-8 string of at most `N` bytes.
///
/// [`BoundedString::new`] truncates longer input at the last char boundary
/// that fits. The text form rejects it instead, so an over-long `"val"`
/// leaves the point untouched. The
/// binary layout is a little-endian `u16` length followed by `N` bytes,
/// zero padded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BoundedString<const N: usize> {
    text: String,
}

impl<const N: usize> BoundedString<N> {
    /// Build from `text`, truncating to `N` bytes.
    #[must_use]
    pub fn new(text: &str) -> Self {
        let mut end = text.len().min(N);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            text: text[..end].to_string(),
        }
    }

    /// Borrow the stored text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Byte capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> fmt::Display for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl<const N: usize> From<&str> for BoundedString<N> {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl<const N: usize> Serialize for BoundedString<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de, const N: usize> Deserialize<'de> for BoundedString<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.len() > N {
            return Err(D::Error::custom(format!(
                "string of {} bytes exceeds capacity {N}",
                text.len()
            )));
        }
        Ok(Self { text })
    }
}

impl<const N: usize> FixedCodec for BoundedString<N> {
    const SIZE: usize = 2 + N;

    fn encode(&self, out: &mut [u8]) {
        let bytes = self.text.as_bytes();
        let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
        out[..2].copy_from_slice(&len.to_le_bytes());
        out[2..2 + bytes.len()].copy_from_slice(bytes);
        out[2 + bytes.len()..].fill(0);
    }

    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        if src.len() != Self::SIZE {
            return Err(CodecError::SizeMismatch {
                expected: Self::SIZE,
                actual: src.len(),
            });
        }
        let len = usize::from(u16::from_le_bytes([src[0], src[1]]));
        if len > N {
            return Err(CodecError::InvalidValue(format!(
                "string length {len} exceeds capacity {N}"
            )));
        }
        let text = std::str::from_utf8(&src[2..2 + len])
            .map_err(|e| CodecError::InvalidValue(e.to_string()))?;
        Ok(Self {
            text: text.to_string(),
        })
    }
}

impl<const N: usize> PointValue for BoundedString<N> {
    fn type_name() -> String {
        format!("BoundedString<{N}>")
    }
}
