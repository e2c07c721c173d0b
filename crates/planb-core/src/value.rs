//! Tagged value model shared by codecs, shards and search.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};

/// An immutable typed value.
///
/// `Date` holds signed epoch milliseconds with no time zone attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Val {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Date(i64),
    String(String),
    Null,
}

impl Val {
    /// Short type name used in errors and schema JSON.
    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Boolean(_) => "boolean",
            Val::Byte(_) => "byte",
            Val::Short(_) => "short",
            Val::Integer(_) => "integer",
            Val::Long(_) => "long",
            Val::Float(_) => "float",
            Val::Double(_) => "double",
            Val::Date(_) => "date",
            Val::String(_) => "string",
            Val::Null => "null",
        }
    }

    pub fn string(s: impl Into<String>) -> Self {
        Val::String(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Val::Null)
    }

    /// Integral view of the value. Strings are parsed; floats truncate.
    pub fn to_long(&self) -> Option<i64> {
        match self {
            Val::Boolean(b) => Some(i64::from(*b)),
            Val::Byte(v) => Some(i64::from(*v)),
            Val::Short(v) => Some(i64::from(*v)),
            Val::Integer(v) => Some(i64::from(*v)),
            Val::Long(v) | Val::Date(v) => Some(*v),
            Val::Float(v) => v.is_finite().then(|| *v as i64),
            Val::Double(v) => v.is_finite().then(|| *v as i64),
            Val::String(s) => s.trim().parse().ok(),
            Val::Null => None,
        }
    }

    /// Floating point view of the value. Strings are parsed.
    pub fn to_double(&self) -> Option<f64> {
        match self {
            Val::Float(v) => Some(f64::from(*v)),
            Val::Double(v) => Some(*v),
            Val::String(s) => s.trim().parse().ok(),
            Val::Null => None,
            other => other.to_long().map(|v| v as f64),
        }
    }

    pub fn to_boolean(&self) -> Option<bool> {
        match self {
            Val::Boolean(b) => Some(*b),
            Val::String(s) => match s.trim() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            Val::Null => None,
            other => other.to_long().map(|v| v != 0),
        }
    }

    /// Borrow the string content, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Val::String(s) => Some(s),
            _ => None,
        }
    }

    fn is_numeric(&self) -> bool {
        !matches!(self, Val::String(_) | Val::Null | Val::Boolean(_))
    }

    /// Compare two values for search predicates.
    ///
    /// Null sorts before everything, numbers compare numerically across
    /// widths, strings lexically. Anything else falls back to comparing the
    /// rendered text.
    pub fn compare(&self, other: &Val) -> Option<Ordering> {
        match (self, other) {
            (Val::Null, Val::Null) => Some(Ordering::Equal),
            (Val::Null, _) => Some(Ordering::Less),
            (_, Val::Null) => Some(Ordering::Greater),
            (Val::String(a), Val::String(b)) => Some(a.cmp(b)),
            (Val::Boolean(a), Val::Boolean(b)) => Some(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => match (a, b) {
                (Val::Float(_) | Val::Double(_), _) | (_, Val::Float(_) | Val::Double(_)) => {
                    a.to_double()?.partial_cmp(&b.to_double()?)
                }
                _ => Some(a.to_long()?.cmp(&b.to_long()?)),
            },
            (a, b) if a.is_numeric() || b.is_numeric() => {
                a.to_double()?.partial_cmp(&b.to_double()?)
            }
            (a, b) => Some(a.to_string().cmp(&b.to_string())),
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Boolean(v) => write!(f, "{}", v),
            Val::Byte(v) => write!(f, "{}", v),
            Val::Short(v) => write!(f, "{}", v),
            Val::Integer(v) => write!(f, "{}", v),
            Val::Long(v) => write!(f, "{}", v),
            Val::Float(v) => write!(f, "{}", v),
            Val::Double(v) => write!(f, "{}", v),
            Val::Date(ms) => match DateTime::from_timestamp_millis(*ms) {
                Some(dt) => write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
                None => write!(f, "{}", ms),
            },
            Val::String(s) => f.write_str(s),
            Val::Null => Ok(()),
        }
    }
}

impl From<bool> for Val {
    fn from(v: bool) -> Self { Val::Boolean(v) }
}

impl From<i32> for Val {
    fn from(v: i32) -> Self { Val::Integer(v) }
}

impl From<i64> for Val {
    fn from(v: i64) -> Self { Val::Long(v) }
}

impl From<f64> for Val {
    fn from(v: f64) -> Self { Val::Double(v) }
}

impl From<&str> for Val {
    fn from(v: &str) -> Self { Val::String(v.to_string()) }
}

impl From<String> for Val {
    fn from(v: String) -> Self { Val::String(v) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string_is_not_null() {
        let empty = Val::string("");
        assert!(!empty.is_null());
        assert_ne!(empty, Val::Null);
        assert_eq!(empty.to_string(), "");
    }

    #[test]
    fn test_numeric_compare_across_widths() {
        assert_eq!(Val::Byte(3).compare(&Val::Long(3)), Some(Ordering::Equal));
        assert_eq!(Val::Integer(-1).compare(&Val::Double(0.5)), Some(Ordering::Less));
        assert_eq!(Val::Null.compare(&Val::Integer(0)), Some(Ordering::Less));
        assert_eq!(Val::string("b").compare(&Val::string("a")), Some(Ordering::Greater));
        assert_eq!(Val::string("10").compare(&Val::Long(9)), Some(Ordering::Greater));
    }

    #[test]
    fn test_date_display() {
        assert_eq!(Val::Date(0).to_string(), "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_conversions() {
        assert_eq!(Val::string(" 42 ").to_long(), Some(42));
        assert_eq!(Val::Double(f64::NAN).to_long(), None);
        assert_eq!(Val::Integer(0).to_boolean(), Some(false));
        assert_eq!(Val::string("true").to_boolean(), Some(true));
        assert_eq!(Val::Null.to_double(), None);
    }
}
