//! Typed value codecs
//!
//! Every logical value type has exactly one codec, and the set is closed:
//! [`ValCodec`] is an enum and every operation is an exhaustive `match`,
//! so adding a type without handling it everywhere does not compile.
//!
//! # Buffer ownership
//!
//! Codecs never hand out owned encodings. `write` and `to_lookup` pass the
//! encoded bytes to a closure, and those bytes are only valid for the
//! duration of that call. Fixed-width codecs encode into a stack array;
//! strings lend their own UTF-8 bytes; interned codecs lend the lookup id.
//!
//! # Interning
//!
//! [`ValCodec::UidLookup`] and [`ValCodec::HashLookup`] store the payload in
//! a lookup table and encode only the fixed-width id. `read` on these
//! codecs costs an extra point lookup; [`ValCodec::uses_lookup`] tells
//! callers when that is the case.

mod fixed;
mod time;
mod unsigned;

use heed::{RoTxn, RwTxn};
use serde::{Deserialize, Serialize};

pub use fixed::{DateMillis, Fixed, FixedWidth};
pub use time::{TemporalResolution, TimeCodec};
pub use unsigned::UnsignedBytes;

use crate::env::PlanBEnv;
use crate::error::{PlanBError, PlanBResult};
use crate::lookup::{HashLength, HashLookupDb, LookupTable, UidLookupDb, UsedLookupsRecorder};
use crate::value::Val;

/// Largest LMDB key. Strings used as raw keys are limited to this minus
/// whatever fixed-width suffix the shard appends.
pub const MAX_KEY_LENGTH: usize = 511;

/// Configured encoding for a key or value field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Date,
    String,
    UidLookup,
    HashLookup,
}

impl FieldType {
    /// Build the codec for this field type.
    ///
    /// `table` names the lookup table used by interning types. Plain
    /// strings are limited to `max_string_len` bytes when given.
    pub fn codec(
        self,
        env: &PlanBEnv,
        table: &str,
        hash_length: HashLength,
        max_string_len: Option<usize>,
    ) -> PlanBResult<ValCodec> {
        Ok(match self {
            FieldType::Boolean => ValCodec::Boolean,
            FieldType::Byte => ValCodec::Byte,
            FieldType::Short => ValCodec::Short,
            FieldType::Int => ValCodec::Integer,
            FieldType::Long => ValCodec::Long,
            FieldType::Float => ValCodec::Float,
            FieldType::Double => ValCodec::Double,
            FieldType::Date => ValCodec::Date,
            FieldType::String => match max_string_len {
                Some(max) => ValCodec::LimitedString(max),
                None => ValCodec::String,
            },
            FieldType::UidLookup => ValCodec::UidLookup(UidLookupDb::open(env, table)?),
            FieldType::HashLookup => {
                ValCodec::HashLookup(HashLookupDb::open(env, table, hash_length)?)
            }
        })
    }
}

/// Closed set of value codecs.
#[derive(Debug, Clone)]
pub enum ValCodec {
    Boolean,
    Byte,
    Short,
    Integer,
    Long,
    Float,
    Double,
    Date,
    /// UTF-8 without a length limit beyond the engine's value size.
    String,
    /// UTF-8 limited to the given number of bytes.
    LimitedString(usize),
    UidLookup(UidLookupDb),
    HashLookup(HashLookupDb),
}

impl ValCodec {
    /// Encoded width if constant for this codec.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ValCodec::Boolean => Some(bool::SIZE),
            ValCodec::Byte => Some(i8::SIZE),
            ValCodec::Short => Some(i16::SIZE),
            ValCodec::Integer => Some(i32::SIZE),
            ValCodec::Long => Some(i64::SIZE),
            ValCodec::Float => Some(f32::SIZE),
            ValCodec::Double => Some(f64::SIZE),
            ValCodec::Date => Some(DateMillis::SIZE),
            ValCodec::String | ValCodec::LimitedString(_) => None,
            ValCodec::UidLookup(db) => Some(db.id_len()),
            ValCodec::HashLookup(db) => Some(db.id_len()),
        }
    }

    /// Encoded size of `val` under this codec.
    pub fn size(&self, val: &Val) -> usize {
        match self.fixed_size() {
            Some(size) => size,
            None => match val {
                Val::String(s) => s.len(),
                other => other.to_string().len(),
            },
        }
    }

    /// True when encode and decode go through a lookup table.
    pub fn uses_lookup(&self) -> bool {
        matches!(self, ValCodec::UidLookup(_) | ValCodec::HashLookup(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ValCodec::Boolean => bool::NAME,
            ValCodec::Byte => i8::NAME,
            ValCodec::Short => i16::NAME,
            ValCodec::Integer => i32::NAME,
            ValCodec::Long => i64::NAME,
            ValCodec::Float => f32::NAME,
            ValCodec::Double => f64::NAME,
            ValCodec::Date => DateMillis::NAME,
            ValCodec::String => "string",
            ValCodec::LimitedString(_) => "limited string",
            ValCodec::UidLookup(_) => "uid lookup",
            ValCodec::HashLookup(_) => "hash lookup",
        }
    }

    /// Decode `bytes`, following the lookup table for interned codecs.
    pub fn read(&self, txn: &RoTxn<'_>, bytes: &[u8]) -> PlanBResult<Val> {
        match self {
            ValCodec::Boolean => Fixed::<bool>::read(bytes),
            ValCodec::Byte => Fixed::<i8>::read(bytes),
            ValCodec::Short => Fixed::<i16>::read(bytes),
            ValCodec::Integer => Fixed::<i32>::read(bytes),
            ValCodec::Long => Fixed::<i64>::read(bytes),
            ValCodec::Float => Fixed::<f32>::read(bytes),
            ValCodec::Double => Fixed::<f64>::read(bytes),
            ValCodec::Date => Fixed::<DateMillis>::read(bytes),
            ValCodec::String | ValCodec::LimitedString(_) => decode_utf8(bytes),
            ValCodec::UidLookup(db) => decode_utf8(db.get_value(txn, bytes)?),
            ValCodec::HashLookup(db) => decode_utf8(db.get_value(txn, bytes)?),
        }
    }

    /// Encode `val` and pass the bytes to `sink`. Interned codecs insert the
    /// payload into their lookup table if it is not there yet.
    pub fn write<R>(
        &self,
        txn: &mut RwTxn<'_>,
        val: &Val,
        sink: impl FnOnce(&[u8]) -> PlanBResult<R>,
    ) -> PlanBResult<R> {
        match self {
            ValCodec::UidLookup(db) => {
                let text = self.text(val)?;
                let id = db.put(txn, text.as_bytes())?;
                sink(&id)
            }
            ValCodec::HashLookup(db) => {
                let text = self.text(val)?;
                let id = db.put(txn, text.as_bytes())?;
                sink(&id)
            }
            _ => self.encode_plain(val, sink),
        }
    }

    /// Encode `val` for a point read without allocating lookup ids.
    /// `continuation` receives `None` when an interned value has never been
    /// stored, in which case no row can reference it.
    pub fn to_lookup<R>(
        &self,
        txn: &RoTxn<'_>,
        val: &Val,
        continuation: impl FnOnce(Option<&[u8]>) -> PlanBResult<R>,
    ) -> PlanBResult<R> {
        match self {
            ValCodec::UidLookup(db) => {
                let id = db.get(txn, self.text(val)?.as_bytes())?;
                continuation(id.as_deref())
            }
            ValCodec::HashLookup(db) => {
                let id = db.get(txn, self.text(val)?.as_bytes())?;
                continuation(id.as_deref())
            }
            _ => self.encode_plain(val, |bytes| continuation(Some(bytes))),
        }
    }

    /// Recorder for the retention sweep, if this codec interns.
    pub fn used_lookups_recorder(&self) -> Option<UsedLookupsRecorder> {
        match self {
            ValCodec::UidLookup(db) => Some(UsedLookupsRecorder::new(LookupTable::Uid(db.clone()))),
            ValCodec::HashLookup(db) => Some(UsedLookupsRecorder::new(LookupTable::Hash(db.clone()))),
            _ => None,
        }
    }

    fn encode_plain<R>(&self, val: &Val, sink: impl FnOnce(&[u8]) -> PlanBResult<R>) -> PlanBResult<R> {
        match self {
            ValCodec::Boolean => Fixed::<bool>::write(val, sink),
            ValCodec::Byte => Fixed::<i8>::write(val, sink),
            ValCodec::Short => Fixed::<i16>::write(val, sink),
            ValCodec::Integer => Fixed::<i32>::write(val, sink),
            ValCodec::Long => Fixed::<i64>::write(val, sink),
            ValCodec::Float => Fixed::<f32>::write(val, sink),
            ValCodec::Double => Fixed::<f64>::write(val, sink),
            ValCodec::Date => Fixed::<DateMillis>::write(val, sink),
            ValCodec::String => sink(self.text(val)?.as_bytes()),
            ValCodec::LimitedString(max) => {
                let text = self.text(val)?;
                if text.len() > *max {
                    return Err(PlanBError::SizeExceeded {
                        component: "string".into(),
                        size: text.len(),
                        max: *max,
                    });
                }
                sink(text.as_bytes())
            }
            ValCodec::UidLookup(_) | ValCodec::HashLookup(_) => Err(PlanBError::InvariantViolation(
                format!("{} codec cannot encode without a lookup table", self.type_name()),
            )),
        }
    }

    /// Text form of a value stored by a string or interned codec.
    fn text<'v>(&self, val: &'v Val) -> PlanBResult<std::borrow::Cow<'v, str>> {
        match val {
            Val::String(s) => Ok(std::borrow::Cow::Borrowed(s.as_str())),
            Val::Null => Err(PlanBError::TypeMismatch {
                expected: self.type_name(),
                found: val.type_name(),
            }),
            other => Ok(std::borrow::Cow::Owned(other.to_string())),
        }
    }
}

fn decode_utf8(bytes: &[u8]) -> PlanBResult<Val> {
    std::str::from_utf8(bytes)
        .map(|s| Val::String(s.to_string()))
        .map_err(|e| PlanBError::corrupt("string", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    fn test_env() -> (PlanBEnv, TempDir) {
        let dir = TempDir::new().unwrap();
        let env = PlanBEnv::open(dir.path(), "codec-test", &Config::budget()).unwrap();
        (env, dir)
    }

    /// Encode every value in a write transaction, then decode in a fresh snapshot.
    fn round_trip(env: &PlanBEnv, codec: &ValCodec, values: Vec<Val>) {
        let c = codec.clone();
        let inputs = values.clone();
        let encoded = env
            .write(move |w| {
                let mut out = Vec::new();
                for v in &inputs {
                    out.push(c.write(w.txn()?, v, |bytes| Ok(bytes.to_vec()))?);
                }
                Ok(out)
            })
            .unwrap();

        env.read(|txn| {
            for (bytes, expected) in encoded.iter().zip(&values) {
                if let Some(size) = codec.fixed_size() {
                    assert_eq!(bytes.len(), size);
                }
                assert_eq!(&codec.read(txn, bytes)?, expected, "{}", codec.type_name());
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_all_codecs_round_trip() {
        let (env, _dir) = test_env();
        let max_string = "x".repeat(MAX_KEY_LENGTH);
        let strings = || vec![Val::string(""), Val::string("hello"), Val::string("ünïcödé")];

        round_trip(&env, &ValCodec::Boolean, vec![Val::Boolean(true), Val::Boolean(false)]);
        round_trip(&env, &ValCodec::Byte, vec![Val::Byte(i8::MIN), Val::Byte(0), Val::Byte(i8::MAX)]);
        round_trip(&env, &ValCodec::Short, vec![Val::Short(i16::MIN), Val::Short(-1), Val::Short(i16::MAX)]);
        round_trip(&env, &ValCodec::Integer, vec![Val::Integer(i32::MIN), Val::Integer(0), Val::Integer(i32::MAX)]);
        round_trip(&env, &ValCodec::Long, vec![Val::Long(i64::MIN), Val::Long(-42), Val::Long(i64::MAX)]);
        round_trip(&env, &ValCodec::Float, vec![Val::Float(-1.5), Val::Float(0.0), Val::Float(f32::MAX)]);
        round_trip(&env, &ValCodec::Double, vec![Val::Double(f64::MIN), Val::Double(0.0), Val::Double(3.25)]);
        round_trip(&env, &ValCodec::Date, vec![Val::Date(0), Val::Date(-1), Val::Date(1_700_000_000_000)]);

        let mut limited = strings();
        limited.push(Val::String(max_string.clone()));
        round_trip(&env, &ValCodec::LimitedString(MAX_KEY_LENGTH), limited);
        round_trip(&env, &ValCodec::String, strings());

        let uid = FieldType::UidLookup.codec(&env, "uid", HashLength::Integer, None).unwrap();
        let mut interned = strings();
        interned.push(Val::String(max_string));
        round_trip(&env, &uid, interned.clone());

        let hash = FieldType::HashLookup.codec(&env, "hash", HashLength::Long, None).unwrap();
        interned.push(Val::String("y".repeat(10_000)));
        round_trip(&env, &hash, interned);
        assert!(hash.uses_lookup());
        assert_eq!(hash.fixed_size(), Some(10));
    }

    #[test]
    fn test_limited_string_one_byte_over() {
        let (env, _dir) = test_env();
        let codec = ValCodec::LimitedString(8);
        let err = env
            .write(move |w| codec.write(w.txn()?, &Val::string("123456789"), |b| Ok(b.len())))
            .unwrap_err();
        assert!(matches!(err, PlanBError::SizeExceeded { size: 9, max: 8, .. }));
    }

    #[test]
    fn test_to_lookup_does_not_allocate() {
        let (env, _dir) = test_env();
        let codec = FieldType::UidLookup.codec(&env, "uid", HashLength::Integer, None).unwrap();

        let found = env
            .read(|txn| codec.to_lookup(txn, &Val::string("unseen"), |id| Ok(id.map(<[u8]>::to_vec))))
            .unwrap();
        assert_eq!(found, None);

        let c = codec.clone();
        let id = env
            .write(move |w| c.write(w.txn()?, &Val::string("seen"), |id| Ok(id.to_vec())))
            .unwrap();
        let found = env
            .read(|txn| codec.to_lookup(txn, &Val::string("seen"), |id| Ok(id.map(<[u8]>::to_vec))))
            .unwrap();
        assert_eq!(found, Some(id));

        let plain = env
            .read(|txn| ValCodec::Integer.to_lookup(txn, &Val::Integer(7), |b| Ok(b.map(<[u8]>::len))))
            .unwrap();
        assert_eq!(plain, Some(4));
    }

    #[test]
    fn test_field_type_json() {
        let json = serde_json::to_string(&FieldType::HashLookup).unwrap();
        assert_eq!(json, "\"HASH_LOOKUP\"");
        let back: FieldType = serde_json::from_str("\"UID_LOOKUP\"").unwrap();
        assert_eq!(back, FieldType::UidLookup);
    }

    #[test]
    fn test_null_is_rejected_by_string_codecs() {
        let (env, _dir) = test_env();
        let err = env
            .write(|w| ValCodec::String.write(w.txn()?, &Val::Null, |b| Ok(b.len())))
            .unwrap_err();
        assert!(matches!(err, PlanBError::TypeMismatch { found: "null", .. }));
    }
}
