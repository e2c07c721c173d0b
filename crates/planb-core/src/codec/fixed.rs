//! Fixed-width encodings.
//!
//! Signed integers and dates are written big-endian with the sign bit
//! flipped, so unsigned byte order matches numeric order and keys sort
//! naturally in LMDB. Floats are written as their raw big-endian bits.

use std::marker::PhantomData;

use crate::error::{PlanBError, PlanBResult};
use crate::value::Val;

/// A value type with a constant encoded width.
pub trait FixedWidth: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;
    /// Name reported in type mismatch errors.
    const NAME: &'static str;
    /// Stack buffer holding one encoded value.
    type Bytes: AsRef<[u8]>;

    fn from_val(val: &Val) -> Option<Self>;
    fn into_val(self) -> Val;
    fn encode(&self) -> Self::Bytes;
    /// Decode from exactly `SIZE` bytes.
    fn decode(bytes: &[u8]) -> Self;
}

/// Epoch milliseconds, kept distinct from `i64` so it decodes to `Val::Date`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DateMillis(pub i64);

/// Codec helper for any [`FixedWidth`] type.
pub struct Fixed<T>(PhantomData<T>);

impl<T: FixedWidth> Fixed<T> {
    pub fn write<R>(val: &Val, sink: impl FnOnce(&[u8]) -> PlanBResult<R>) -> PlanBResult<R> {
        let v = T::from_val(val).ok_or(PlanBError::TypeMismatch {
            expected: T::NAME,
            found: val.type_name(),
        })?;
        sink(v.encode().as_ref())
    }

    pub fn read(bytes: &[u8]) -> PlanBResult<Val> {
        Ok(Self::decode(bytes)?.into_val())
    }

    pub fn decode(bytes: &[u8]) -> PlanBResult<T> {
        if bytes.len() != T::SIZE {
            return Err(PlanBError::corrupt(
                T::NAME,
                format!("expected {} bytes, found {}", T::SIZE, bytes.len()),
            ));
        }
        Ok(T::decode(bytes))
    }
}

macro_rules! fixed_signed {
    ($ty:ty, $unsigned:ty, $size:expr, $name:expr, $variant:ident) => {
        impl FixedWidth for $ty {
            const SIZE: usize = $size;
            const NAME: &'static str = $name;
            type Bytes = [u8; $size];

            fn from_val(val: &Val) -> Option<Self> {
                match val {
                    Val::$variant(v) => Some(*v),
                    other => other.to_long().and_then(|v| <$ty>::try_from(v).ok()),
                }
            }

            fn into_val(self) -> Val {
                Val::$variant(self)
            }

            fn encode(&self) -> Self::Bytes {
                ((*self as $unsigned) ^ (1 << (<$unsigned>::BITS - 1))).to_be_bytes()
            }

            fn decode(bytes: &[u8]) -> Self {
                let mut raw = [0u8; $size];
                raw.copy_from_slice(bytes);
                (<$unsigned>::from_be_bytes(raw) ^ (1 << (<$unsigned>::BITS - 1))) as $ty
            }
        }
    };
}

fixed_signed!(i8, u8, 1, "byte", Byte);
fixed_signed!(i16, u16, 2, "short", Short);
fixed_signed!(i32, u32, 4, "integer", Integer);
fixed_signed!(i64, u64, 8, "long", Long);

impl FixedWidth for bool {
    const SIZE: usize = 1;
    const NAME: &'static str = "boolean";
    type Bytes = [u8; 1];

    fn from_val(val: &Val) -> Option<Self> {
        val.to_boolean()
    }

    fn into_val(self) -> Val {
        Val::Boolean(self)
    }

    fn encode(&self) -> Self::Bytes {
        [u8::from(*self)]
    }

    fn decode(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl FixedWidth for f32 {
    const SIZE: usize = 4;
    const NAME: &'static str = "float";
    type Bytes = [u8; 4];

    fn from_val(val: &Val) -> Option<Self> {
        match val {
            Val::Float(v) => Some(*v),
            other => other.to_double().map(|v| v as f32),
        }
    }

    fn into_val(self) -> Val {
        Val::Float(self)
    }

    fn encode(&self) -> Self::Bytes {
        self.to_be_bytes()
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        f32::from_be_bytes(raw)
    }
}

impl FixedWidth for f64 {
    const SIZE: usize = 8;
    const NAME: &'static str = "double";
    type Bytes = [u8; 8];

    fn from_val(val: &Val) -> Option<Self> {
        val.to_double()
    }

    fn into_val(self) -> Val {
        Val::Double(self)
    }

    fn encode(&self) -> Self::Bytes {
        self.to_be_bytes()
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        f64::from_be_bytes(raw)
    }
}

impl FixedWidth for DateMillis {
    const SIZE: usize = 8;
    const NAME: &'static str = "date";
    type Bytes = [u8; 8];

    fn from_val(val: &Val) -> Option<Self> {
        match val {
            Val::Date(ms) => Some(DateMillis(*ms)),
            Val::String(s) => chrono::DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| DateMillis(dt.timestamp_millis()))
                .or_else(|| val.to_long().map(DateMillis)),
            other => other.to_long().map(DateMillis),
        }
    }

    fn into_val(self) -> Val {
        Val::Date(self.0)
    }

    fn encode(&self) -> Self::Bytes {
        self.0.encode()
    }

    fn decode(bytes: &[u8]) -> Self {
        DateMillis(i64::decode(bytes))
    }
}
