//! Byte-level helpers shared by the shard row layouts.

use chrono::Utc;
use planb_core::codec::{DateMillis, Fixed, FixedWidth};
use planb_core::{PlanBError, PlanBResult, Val};

/// Append an order-preserving 8 byte timestamp.
pub(crate) fn put_millis(buf: &mut Vec<u8>, ms: i64) {
    buf.extend_from_slice(&DateMillis(ms).encode());
}

/// Read the 8 byte timestamp at `at`.
pub(crate) fn read_millis(bytes: &[u8], at: usize, component: &str) -> PlanBResult<i64> {
    let slice = bytes.get(at..at + DateMillis::SIZE).ok_or_else(|| {
        PlanBError::corrupt(component, format!("row of {} bytes has no timestamp at offset {}", bytes.len(), at))
    })?;
    Ok(Fixed::<DateMillis>::decode(slice)?.0)
}

/// Split `bytes` at `at`, failing on short rows.
pub(crate) fn split<'a>(bytes: &'a [u8], at: usize, component: &str) -> PlanBResult<(&'a [u8], &'a [u8])> {
    if bytes.len() < at {
        return Err(PlanBError::corrupt(
            component,
            format!("expected at least {} bytes, found {}", at, bytes.len()),
        ));
    }
    Ok(bytes.split_at(at))
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Unsigned counter as a value, widening to double past `i64::MAX`.
pub(crate) fn unsigned_val(v: u64) -> Val {
    i64::try_from(v).map(Val::Long).unwrap_or(Val::Double(v as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_trip() {
        let mut buf = vec![0xFF];
        put_millis(&mut buf, -5);
        assert_eq!(read_millis(&buf, 1, "test").unwrap(), -5);
        assert!(read_millis(&buf, 2, "test").is_err());
    }

    #[test]
    fn test_split_rejects_short_rows() {
        let (head, tail) = split(b"abcd", 1, "test").unwrap();
        assert_eq!((head, tail), (&b"a"[..], &b"bcd"[..]));
        assert!(split(b"ab", 3, "test").is_err());
    }

    #[test]
    fn test_unsigned_val() {
        assert_eq!(unsigned_val(7), Val::Long(7));
        assert_eq!(unsigned_val(u64::MAX), Val::Double(u64::MAX as f64));
    }
}
